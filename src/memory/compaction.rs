//! Context Compaction（可选）
//!
//! 日志超过阈值时，把最旧的一段已闭合区间摘要为一条 system 消息，保留最近 keep 条。
//! 切点只会向前移动，保证 assistant 的 ToolCall 与其 tool_result 不被拆开。

use std::sync::Arc;

use async_trait::async_trait;

use super::message::{Message, Role};
use super::session_log::SessionLog;
use crate::core::DispatchError;
use crate::llm::{Decider, DecisionRequest};

const SUMMARY_DIRECTIVE: &str = "Summarize the conversation so far in a few sentences. \
Keep order numbers, product names and any unresolved user requests.";

/// 摘要能力
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, DispatchError>;
}

/// 用决策单元做摘要：不提供任何能力，只取文本
pub struct DeciderSummarizer {
    decider: Arc<dyn Decider>,
}

impl DeciderSummarizer {
    pub fn new(decider: Arc<dyn Decider>) -> Self {
        Self { decider }
    }
}

#[async_trait]
impl Summarizer for DeciderSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, DispatchError> {
        let decision = self
            .decider
            .decide(DecisionRequest {
                node: "compaction",
                directive: SUMMARY_DIRECTIVE,
                messages,
                capabilities: &[],
            })
            .await?;
        Ok(decision.text)
    }
}

/// 计算安全切点：messages[..cut] 被摘要，messages[cut..] 保留。
/// 若切点落在 tool_result 上，说明其 assistant 在切点之前，向前移动直到不再拆分。
pub fn safe_cut(messages: &[Message], desired: usize) -> usize {
    let mut cut = desired.min(messages.len());
    while cut > 0 && cut < messages.len() && messages[cut].role == Role::ToolResult {
        cut -= 1;
    }
    cut
}

/// 压缩器
pub struct Compactor {
    summarizer: Arc<dyn Summarizer>,
    trigger: usize,
    keep: usize,
}

impl Compactor {
    pub fn new(summarizer: Arc<dyn Summarizer>, trigger: usize, keep: usize) -> Self {
        Self {
            summarizer,
            trigger,
            keep: keep.max(1),
        }
    }

    /// 需要时压缩日志；返回是否发生了替换。版本号不变，由调用方随本轮一起持久化。
    pub async fn compact(&self, log: &mut SessionLog) -> Result<bool, DispatchError> {
        if log.len() <= self.trigger {
            return Ok(false);
        }
        let cut = safe_cut(&log.messages, log.len().saturating_sub(self.keep));
        if cut < 2 {
            return Ok(false);
        }
        let summary = self.summarizer.summarize(&log.messages[..cut]).await?;
        if summary.trim().is_empty() {
            return Ok(false);
        }
        let mut messages = Vec::with_capacity(log.len() - cut + 1);
        messages.push(Message::system(format!(
            "Previous conversation summary:\n\n{summary}"
        )));
        messages.extend(log.messages.drain(cut..));
        tracing::info!(summarized = cut, kept = messages.len() - 1, "context compacted");
        log.messages = messages;
        Ok(true)
    }
}
