//! 消息模型
//!
//! system / user / assistant / tool_result 四种角色；assistant 可携带有序的 ToolCall，
//! tool_result 通过 tool_call_id 回指它所应答的调用。插入顺序即对话顺序。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// 一次工具（或子智能体）调用请求；id 在同一条日志内唯一
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// 新的随机调用 id
pub fn fresh_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

impl ToolCall {
    /// 生成随机 id 的调用
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id: fresh_call_id(),
            name: name.into(),
            args,
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// 用 JSON 对象构造参数；非对象值视为无参数
    pub fn from_json(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::with_id(id, name, args)
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// 请求工具的 assistant 消息，content 可为空
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::ToolResult, content)
        }
    }

    /// 是否为携带 ToolCall 的 assistant 消息
    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    /// 是否应出现在对外历史中（过滤 system、tool_result 与仅请求工具的 assistant）
    pub fn is_user_visible(&self) -> bool {
        match self.role {
            Role::User => true,
            Role::Assistant => !self.content.trim().is_empty(),
            Role::System | Role::ToolResult => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_keeps_calls_and_back_reference() {
        let call = ToolCall::from_json("call_1", "get_order", json!({"order_no": "A1001"}));
        let log = vec![
            Message::user("query order A1001"),
            Message::assistant_with_calls("", vec![call.clone()]),
            Message::tool_result("call_1", "order text"),
        ];
        let raw = serde_json::to_string(&log).unwrap();
        assert!(raw.contains("\"role\":\"tool_result\""));
        let back: Vec<Message> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, log);
        assert_eq!(back[1].tool_calls[0], call);
        assert_eq!(back[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_visibility() {
        assert!(Message::user("hi").is_user_visible());
        assert!(Message::assistant("hello").is_user_visible());
        assert!(!Message::assistant_with_calls("", vec![ToolCall::new("x", Map::new())]).is_user_visible());
        assert!(!Message::tool_result("c", "r").is_user_visible());
        assert!(!Message::system("s").is_user_visible());
    }
}
