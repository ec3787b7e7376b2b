//! OpenAI 兼容 API 决策单元
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；能力 schema 作为 function tools 传入。
//! 支持 DeepSeek、OpenAI、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionResponseMessage,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::DispatchError;
use crate::llm::{Decider, Decision, DecisionRequest};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::CapabilitySchema;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

fn request_err(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Decision(e.to_string())
}

/// 会话日志转为 Chat Completions 消息；directive 非空时作为首条 system 消息
fn to_openai_messages(
    directive: &str,
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, DispatchError> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !directive.is_empty() {
        out.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(directive.to_string())
                .build()
                .map_err(request_err)?,
        ));
    }
    for m in messages {
        let message = match m.role {
            Role::System => ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(request_err)?,
            ),
            Role::User => ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(request_err)?,
            ),
            Role::Assistant => {
                let mut assistant = ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(request_err)?;
                if !m.tool_calls.is_empty() {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": Value::Object(c.args.clone()).to_string(),
                                },
                            })
                        })
                        .collect();
                    assistant.tool_calls =
                        Some(serde_json::from_value(Value::Array(calls)).map_err(request_err)?);
                }
                ChatCompletionRequestMessage::Assistant(assistant)
            }
            Role::ToolResult => ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .content(m.content.clone())
                    .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                    .build()
                    .map_err(request_err)?,
            ),
        };
        out.push(message);
    }
    Ok(out)
}

fn build_request(
    model: &str,
    request: &DecisionRequest<'_>,
) -> Result<CreateChatCompletionRequest, DispatchError> {
    let mut body = CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(to_openai_messages(request.directive, request.messages)?)
        .build()
        .map_err(request_err)?;
    if !request.capabilities.is_empty() {
        let tools: Vec<Value> = request
            .capabilities
            .iter()
            .map(|c: &CapabilitySchema| json!({ "type": "function", "function": c }))
            .collect();
        body.tools = Some(serde_json::from_value(Value::Array(tools)).map_err(request_err)?);
    }
    Ok(body)
}

/// 回复消息转为决策：有 tool_calls 即工具请求
fn to_decision(message: &ChatCompletionResponseMessage) -> Decision {
    let calls = message
        .tool_calls
        .as_ref()
        .and_then(|calls| serde_json::to_value(calls).ok())
        .and_then(|v| match v {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default();
    let tool_calls = calls
        .iter()
        .filter_map(|c| {
            let function = c.get("function")?;
            let name = function.get("name")?.as_str()?;
            let id = c.get("id").and_then(Value::as_str).unwrap_or_default();
            // 模型偶尔输出非法 JSON 参数，按空参数处理，由工具自身报告缺参
            let args = function
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok())
                .unwrap_or_default();
            Some(ToolCall::with_id(id, name, args))
        })
        .collect();
    Decision {
        text: message.content.clone().unwrap_or_default(),
        tool_calls,
    }
}

/// OpenAI 兼容决策单元：持有 Client 与 model 名
pub struct OpenAiDecider {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiDecider {
    /// 缺少 API Key 时返回配置错误
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| DispatchError::Config("missing API key for OpenAI-compatible decider".into()))?;

        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Ok(Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout,
            usage: TokenUsage::new(),
        })
    }
}

#[async_trait]
impl Decider for OpenAiDecider {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DispatchError> {
        let body = build_request(&self.model, &request)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(body))
            .await
            .map_err(|_| DispatchError::Decision(format!("request timed out after {:?}", self.timeout)))?
            .map_err(request_err)?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .first()
            .ok_or_else(|| DispatchError::Decision("empty choices".into()))?;
        tracing::debug!(node = request.node, "decision received");
        Ok(to_decision(&choice.message))
    }
}
