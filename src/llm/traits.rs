//! 决策单元抽象
//!
//! Decide(directive, log, capabilities) -> { text, tool_calls }；对调度核心而言无状态。
//! 具体后端（OpenAI 兼容 HTTP / 脚本化 Mock）实现 Decider。

use async_trait::async_trait;

use crate::core::DispatchError;
use crate::memory::{Message, ToolCall};
use crate::tools::CapabilitySchema;

/// 一次决策的输入
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    /// 发起决策的节点名（日志与脚本化 Mock 使用）
    pub node: &'a str,
    pub directive: &'a str,
    pub messages: &'a [Message],
    pub capabilities: &'a [CapabilitySchema],
}

/// 决策结果：有 tool_calls 即请求工具，否则 text 为最终回答
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Decision {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn call(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: String::new(),
            tool_calls,
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// 决策单元
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DispatchError>;

    /// 累计 token 使用：(prompt, completion, total)；默认不统计
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
