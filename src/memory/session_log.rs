//! 会话日志
//!
//! 一个会话的有序消息序列 + 单调递增版本号。唯一的一致性约束：
//! 每个已持久化 assistant 消息中的 ToolCall 必须有且仅有一条之后的 tool_result 与之配对，
//! 除非该 assistant 消息就是日志最后一条（本轮在结果产生前被打断）。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::{Message, Role, ToolCall};

/// 配对约束被破坏的具体形式
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("tool call {0} has no tool_result")]
    Unanswered(String),
    #[error("tool call {0} answered more than once")]
    DuplicateResult(String),
    #[error("tool_result {0} does not answer an earlier tool call")]
    OrphanResult(String),
    #[error("tool call id {0} is not unique")]
    DuplicateCallId(String),
}

/// 会话日志：消息 + 存储版本
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    pub messages: Vec<Message>,
    pub version: u64,
}

impl SessionLog {
    pub fn new(messages: Vec<Message>, version: u64) -> Self {
        Self { messages, version }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 尾部悬空的 ToolCall：最后一条携带调用的 assistant 之后只有 tool_result，
    /// 且其中缺少某些调用的结果。按调用发出顺序返回。
    pub fn dangling_tool_calls(&self) -> Vec<&ToolCall> {
        dangling_tool_calls(&self.messages)
    }

    /// 对外可见的历史（过滤内部角色）
    pub fn visible_history(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.is_user_visible())
            .cloned()
            .collect()
    }

    /// 检查配对约束；末尾 assistant 消息的调用允许暂时无结果
    pub fn check_pairing(&self) -> Result<(), PairingError> {
        check_pairing(&self.messages)
    }
}

/// 见 [`SessionLog::dangling_tool_calls`]
pub fn dangling_tool_calls(messages: &[Message]) -> Vec<&ToolCall> {
    let Some(idx) = messages.iter().rposition(|m| m.role != Role::ToolResult) else {
        return Vec::new();
    };
    let owner = &messages[idx];
    if !owner.requests_tools() {
        return Vec::new();
    }
    let answered: HashSet<&str> = messages[idx + 1..]
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    owner
        .tool_calls
        .iter()
        .filter(|c| !answered.contains(c.id.as_str()))
        .collect()
}

/// 见 [`SessionLog::check_pairing`]
pub fn check_pairing(messages: &[Message]) -> Result<(), PairingError> {
    // id -> (所在消息下标, 已收到的结果数)
    let mut calls: HashMap<&str, (usize, usize)> = HashMap::new();
    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                for call in &msg.tool_calls {
                    if calls.insert(call.id.as_str(), (idx, 0)).is_some() {
                        return Err(PairingError::DuplicateCallId(call.id.clone()));
                    }
                }
            }
            Role::ToolResult => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                match calls.get_mut(id) {
                    Some((_, count)) => {
                        *count += 1;
                        if *count > 1 {
                            return Err(PairingError::DuplicateResult(id.to_string()));
                        }
                    }
                    None => return Err(PairingError::OrphanResult(id.to_string())),
                }
            }
            Role::System | Role::User => {}
        }
    }
    let last = messages.len().saturating_sub(1);
    // 按出现顺序报告第一个缺失结果的调用
    let mut unanswered: Vec<(usize, &str)> = calls
        .iter()
        .filter(|(_, (idx, count))| *count == 0 && *idx != last)
        .map(|(id, (idx, _))| (*idx, *id))
        .collect();
    unanswered.sort();
    match unanswered.first() {
        Some((_, id)) => Err(PairingError::Unanswered(id.to_string())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall::from_json(id, "get_order", json!({"order_no": "A1001"}))
    }

    #[test]
    fn test_closed_log_passes() {
        let log = SessionLog::new(
            vec![
                Message::user("q"),
                Message::assistant_with_calls("", vec![call("c1"), call("c2")]),
                Message::tool_result("c1", "r1"),
                Message::tool_result("c2", "r2"),
                Message::assistant("done"),
            ],
            3,
        );
        assert!(log.check_pairing().is_ok());
        assert!(log.dangling_tool_calls().is_empty());
    }

    #[test]
    fn test_trailing_call_is_allowed_but_dangling() {
        let log = SessionLog::new(
            vec![
                Message::user("q"),
                Message::assistant_with_calls("", vec![call("c1")]),
            ],
            1,
        );
        assert!(log.check_pairing().is_ok());
        let dangling: Vec<&str> = log.dangling_tool_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(dangling, vec!["c1"]);
    }

    #[test]
    fn test_partially_answered_calls() {
        let log = SessionLog::new(
            vec![
                Message::user("q"),
                Message::assistant_with_calls("", vec![call("c1"), call("c2"), call("c3")]),
                Message::tool_result("c2", "r2"),
            ],
            2,
        );
        assert_eq!(log.check_pairing(), Err(PairingError::Unanswered("c1".into())));
        let dangling: Vec<&str> = log.dangling_tool_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(dangling, vec!["c1", "c3"]);
    }

    #[test]
    fn test_violations_detected() {
        let dup = vec![
            Message::assistant_with_calls("", vec![call("c1")]),
            Message::tool_result("c1", "a"),
            Message::tool_result("c1", "b"),
        ];
        assert_eq!(check_pairing(&dup), Err(PairingError::DuplicateResult("c1".into())));

        let orphan = vec![Message::user("q"), Message::tool_result("zz", "a")];
        assert_eq!(check_pairing(&orphan), Err(PairingError::OrphanResult("zz".into())));

        let reused = vec![
            Message::assistant_with_calls("", vec![call("c1")]),
            Message::tool_result("c1", "a"),
            Message::assistant_with_calls("", vec![call("c1")]),
        ];
        assert_eq!(check_pairing(&reused), Err(PairingError::DuplicateCallId("c1".into())));
    }

    #[test]
    fn test_empty_log_has_nothing_dangling() {
        let log = SessionLog::default();
        assert!(log.dangling_tool_calls().is_empty());
        assert_eq!(log.version, 0);
    }
}
