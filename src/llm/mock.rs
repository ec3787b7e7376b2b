//! Mock 决策单元（用于测试与本地运行，无需 API）
//!
//! ScriptedDecider：按节点名排队的脚本化决策，并记录每次收到的请求，便于断言隔离性。
//! EchoDecider：直接回显最后一条 user 消息。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::DispatchError;
use crate::llm::{Decider, Decision, DecisionRequest};
use crate::memory::{Message, Role, ToolCall};

/// 一次被记录的决策请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub node: String,
    pub messages: Vec<Message>,
    pub capabilities: Vec<String>,
}

/// 脚本化决策：每个节点一条队列；队列耗尽后若设置了 fallback 则重复返回（ToolCall id 重新生成）
#[derive(Default)]
pub struct ScriptedDecider {
    scripts: Mutex<HashMap<String, VecDeque<Result<Decision, DispatchError>>>>,
    fallback: Option<Decision>,
    recorded: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedDecider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为节点追加一次决策
    pub fn push(self, node: &str, decision: Decision) -> Self {
        self.push_result(node, Ok(decision))
    }

    /// 为节点追加一次失败
    pub fn push_error(self, node: &str, err: DispatchError) -> Self {
        self.push_result(node, Err(err))
    }

    fn push_result(self, node: &str, result: Result<Decision, DispatchError>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(node.to_string()).or_default().push_back(result);
        }
        self
    }

    /// 任何节点脚本耗尽后的默认决策
    pub fn with_fallback(mut self, decision: Decision) -> Self {
        self.fallback = Some(decision);
        self
    }

    /// 已记录的请求（按调用顺序）
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// 某节点被调用的次数
    pub fn calls_for(&self, node: &str) -> usize {
        self.recorded().iter().filter(|r| r.node == node).count()
    }
}

#[async_trait]
impl Decider for ScriptedDecider {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DispatchError> {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(RecordedRequest {
                node: request.node.to_string(),
                messages: request.messages.to_vec(),
                capabilities: request.capabilities.iter().map(|c| c.name.clone()).collect(),
            });
        }
        let scripted = self
            .scripts
            .lock()
            .map_err(|_| DispatchError::Decision("script lock poisoned".into()))?
            .get_mut(request.node)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(result) => result,
            None => match &self.fallback {
                Some(decision) => Ok(Decision {
                    text: decision.text.clone(),
                    tool_calls: decision
                        .tool_calls
                        .iter()
                        .map(|c| ToolCall::new(c.name.clone(), c.args.clone()))
                        .collect(),
                }),
                None => Err(DispatchError::Decision(format!(
                    "no scripted decision left for node {}",
                    request.node
                ))),
            },
        }
    }
}

/// 回显最后一条 user 消息
#[derive(Debug, Default)]
pub struct EchoDecider;

#[async_trait]
impl Decider for EchoDecider {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DispatchError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(Decision::answer(format!("Echo from {}: {}", request.node, last_user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn request<'a>(node: &'a str, messages: &'a [Message]) -> DecisionRequest<'a> {
        DecisionRequest {
            node,
            directive: "",
            messages,
            capabilities: &[],
        }
    }

    #[tokio::test]
    async fn test_scripts_are_per_node() {
        let decider = ScriptedDecider::new()
            .push("a", Decision::answer("from a"))
            .push("b", Decision::answer("from b"));
        let msgs = [Message::user("hi")];
        assert_eq!(decider.decide(request("b", &msgs)).await.unwrap().text, "from b");
        assert_eq!(decider.decide(request("a", &msgs)).await.unwrap().text, "from a");
        assert!(decider.decide(request("a", &msgs)).await.is_err());
        assert_eq!(decider.calls_for("a"), 2);
    }

    #[tokio::test]
    async fn test_fallback_regenerates_call_ids() {
        let decider = ScriptedDecider::new()
            .with_fallback(Decision::call(vec![ToolCall::new("get_order", Map::new())]));
        let msgs = [Message::user("hi")];
        let first = decider.decide(request("x", &msgs)).await.unwrap();
        let second = decider.decide(request("x", &msgs)).await.unwrap();
        assert_ne!(first.tool_calls[0].id, second.tool_calls[0].id);
    }

    #[tokio::test]
    async fn test_echo() {
        let msgs = [Message::user("hello")];
        let d = EchoDecider.decide(request("entry", &msgs)).await.unwrap();
        assert!(d.is_final());
        assert_eq!(d.text, "Echo from entry: hello");
    }
}
