//! 能力 Schema：工具与子智能体在决策单元眼中的统一描述
//!
//! 子智能体的参数 schema 由 schemars 从 [`DelegateArgs`] 生成；工具的公开 schema 去掉隐藏参数。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 决策单元可见的一项能力（工具或子智能体，形状相同）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 委派给子智能体时的参数
#[derive(Debug, Clone, JsonSchema, Serialize, Deserialize)]
pub struct DelegateArgs {
    /// 交给子智能体处理的完整任务描述（包含订单号、商品名等必要信息）
    pub task: String,
}

/// 子智能体的参数 schema
pub fn delegate_schema() -> Value {
    let schema = schema_for!(DelegateArgs);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "object",
            "properties": {"task": {"type": "string"}},
            "required": ["task"]
        })
    });
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

/// 从 ToolCall 参数得到子智能体的初始 user 内容：优先取 task 字段，否则整体序列化
pub fn delegation_input(args: &Map<String, Value>) -> String {
    match args.get("task") {
        Some(Value::String(task)) => task.clone(),
        _ => Value::Object(args.clone()).to_string(),
    }
}

/// 从参数 schema 中移除某个参数（properties 与 required 同时移除）
pub fn strip_parameter(schema: &Value, hidden: &str) -> Value {
    let mut schema = schema.clone();
    if let Some(obj) = schema.as_object_mut() {
        if let Some(Value::Object(props)) = obj.get_mut("properties") {
            props.remove(hidden);
        }
        if let Some(Value::Array(required)) = obj.get_mut("required") {
            required.retain(|v| v.as_str() != Some(hidden));
        }
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_parameter_removes_property_and_requirement() {
        let schema = json!({
            "type": "object",
            "properties": {
                "order_no": {"type": "string"},
                "user_id": {"type": "string"}
            },
            "required": ["order_no", "user_id"]
        });
        let public = strip_parameter(&schema, "user_id");
        assert!(public["properties"].get("user_id").is_none());
        assert!(public["properties"].get("order_no").is_some());
        assert_eq!(public["required"], json!(["order_no"]));
        // 原 schema 不受影响
        assert!(schema["properties"].get("user_id").is_some());
    }

    #[test]
    fn test_delegate_schema_requires_task() {
        let schema = delegate_schema();
        assert!(schema["properties"].get("task").is_some());
        assert_eq!(schema["required"], json!(["task"]));
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn test_delegation_input_prefers_task() {
        let args = json!({"task": "query order A1001"});
        assert_eq!(delegation_input(args.as_object().unwrap()), "query order A1001");
        let args = json!({"order_no": "A1001"});
        assert_eq!(delegation_input(args.as_object().unwrap()), r#"{"order_no":"A1001"}"#);
    }
}
