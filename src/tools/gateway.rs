//! 工具网关
//!
//! 对决策单元公开去掉隐藏参数（调用方身份）的 schema；调用时从会话 Identity 注入该参数，
//! 覆盖模型可能自行填写的同名字段。每次调用加超时并输出结构化审计日志（JSON）。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::core::{DispatchError, Identity};
use crate::tools::schema::{strip_parameter, CapabilitySchema};
use crate::tools::{Tool, ToolError, ToolRegistry};

struct GatewayEntry {
    tool: Arc<dyn Tool>,
    hidden_param: String,
    schema: CapabilitySchema,
}

/// 工具网关：身份注入 + 超时 + 审计
pub struct ToolGateway {
    entries: BTreeMap<String, GatewayEntry>,
    timeout: Duration,
}

impl ToolGateway {
    pub fn new(timeout_secs: u64) -> Self {
        Self::with_timeout(Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            timeout,
        }
    }

    /// 注册工具：公开 schema = 声明 schema 去掉 hidden_param
    pub fn register(&mut self, tool: Arc<dyn Tool>, hidden_param: impl Into<String>) {
        let hidden_param = hidden_param.into();
        let schema = CapabilitySchema {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: strip_parameter(&tool.parameters_schema(), &hidden_param),
        };
        self.entries.insert(
            schema.name.clone(),
            GatewayEntry {
                tool,
                hidden_param,
                schema,
            },
        );
    }

    /// 注册表中的全部工具使用同一个隐藏参数
    pub fn register_all(&mut self, registry: &ToolRegistry, hidden_param: &str) {
        for tool in registry.iter() {
            self.register(Arc::clone(tool), hidden_param);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// 模型可见的 schema
    pub fn schema(&self, name: &str) -> Option<&CapabilitySchema> {
        self.entries.get(name).map(|e| &e.schema)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// 调用工具：身份为空返回 IdentityMissing；否则合并 {hidden_param: identity} 后转发，结果原样返回。
    /// 对网关而言每次调用至多执行一次，不做重试。
    pub async fn invoke(
        &self,
        name: &str,
        model_args: &Map<String, Value>,
        identity: &Identity,
    ) -> Result<String, DispatchError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| DispatchError::UnknownCapability(name.to_string()))?;
        if identity.is_empty() {
            tracing::warn!(tool = name, "tool invoked without caller identity");
            return Err(DispatchError::IdentityMissing(name.to_string()));
        }
        if model_args.contains_key(&entry.hidden_param) {
            tracing::warn!(
                tool = name,
                param = %entry.hidden_param,
                "model supplied hidden parameter, overriding with caller identity"
            );
        }

        let args_preview = args_preview(model_args, &entry.hidden_param);
        let mut args = model_args.clone();
        args.insert(
            entry.hidden_param.clone(),
            Value::String(identity.as_str().to_string()),
        );

        let start = Instant::now();
        let result = timeout(self.timeout, entry.tool.execute(Value::Object(args))).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(ToolError::Transient(_))) => (false, "transient"),
            Ok(Err(ToolError::Permanent(_))) => (false, "permanent"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(ToolError::Transient(message))) => Err(DispatchError::ToolTransient {
                tool: name.to_string(),
                message,
            }),
            Ok(Err(ToolError::Permanent(message))) => Err(DispatchError::ToolPermanent {
                tool: name.to_string(),
                message,
            }),
            Err(_) => Err(DispatchError::ToolTransient {
                tool: name.to_string(),
                message: format!("timed out after {} ms", self.timeout.as_millis()),
            }),
        }
    }
}

/// 审计用参数预览，不包含隐藏参数
fn args_preview(args: &Map<String, Value>, hidden: &str) -> String {
    let visible: Map<String, Value> = args
        .iter()
        .filter(|(k, _)| k.as_str() != hidden)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let s = Value::Object(visible).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// 记录收到的参数
    struct RecordingTool {
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &str {
            "get_order"
        }

        fn description(&self) -> &str {
            "Look up an order"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "order_no": {"type": "string"},
                    "user_id": {"type": "string"}
                },
                "required": ["order_no", "user_id"]
            })
        }

        async fn execute(&self, args: Value) -> Result<String, ToolError> {
            self.seen.lock().unwrap().push(args.clone());
            Ok(format!("order {} for {}", args["order_no"], args["user_id"]))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "never finishes in time"
        }

        async fn execute(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn gateway_with(tool: Arc<RecordingTool>) -> ToolGateway {
        let mut gw = ToolGateway::new(5);
        gw.register(tool, "user_id");
        gw
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_public_schema_hides_identity_param() {
        let gw = gateway_with(Arc::new(RecordingTool { seen: Mutex::new(vec![]) }));
        let schema = gw.schema("get_order").unwrap();
        assert!(schema.parameters["properties"].get("user_id").is_none());
        assert_eq!(schema.parameters["required"], json!(["order_no"]));
    }

    #[tokio::test]
    async fn test_identity_is_injected() {
        let tool = Arc::new(RecordingTool { seen: Mutex::new(vec![]) });
        let gw = gateway_with(Arc::clone(&tool));
        let out = gw
            .invoke("get_order", &args(json!({"order_no": "A1001"})), &Identity::new("u1"))
            .await
            .unwrap();
        assert!(out.contains("A1001"));
        let seen = tool.seen.lock().unwrap();
        assert_eq!(seen[0], json!({"order_no": "A1001", "user_id": "u1"}));
    }

    #[tokio::test]
    async fn test_model_cannot_override_identity() {
        let tool = Arc::new(RecordingTool { seen: Mutex::new(vec![]) });
        let gw = gateway_with(Arc::clone(&tool));
        gw.invoke(
            "get_order",
            &args(json!({"order_no": "A1003", "user_id": "2"})),
            &Identity::new("1"),
        )
        .await
        .unwrap();
        assert_eq!(tool.seen.lock().unwrap()[0]["user_id"], json!("1"));
    }

    #[tokio::test]
    async fn test_missing_identity_fails_without_calling_tool() {
        let tool = Arc::new(RecordingTool { seen: Mutex::new(vec![]) });
        let gw = gateway_with(Arc::clone(&tool));
        let err = gw
            .invoke("get_order", &args(json!({"order_no": "A1001"})), &Identity::new(""))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::IdentityMissing("get_order".into()));
        assert!(tool.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_timeout() {
        let mut gw = ToolGateway::with_timeout(Duration::from_millis(20));
        gw.register(Arc::new(SlowTool), "user_id");
        let err = gw.invoke("nope", &Map::new(), &Identity::new("u1")).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownCapability("nope".into()));
        let err = gw.invoke("slow", &Map::new(), &Identity::new("u1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::ToolTransient { .. }));
    }

    #[test]
    fn test_args_preview_skips_hidden() {
        let preview = args_preview(&args(json!({"order_no": "A1", "user_id": "secret"})), "user_id");
        assert!(!preview.contains("secret"));
        assert!(preview.contains("A1"));
    }
}
