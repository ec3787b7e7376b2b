//! HTTP 传输层（axum）
//!
//! 路径中的 user_id 同时作为会话 key 与调用方身份；错误统一返回 `{"detail": "..."}`。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::{DispatchError, Identity, SessionCoordinator};
use crate::memory::{Message, Role};

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub role: String,
}

/// 对外历史条目
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
}

/// 错误到状态码：忙 429、超时 504、存储不可用 503、其余 500
fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::SessionBusy(_) => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_api_error(err: DispatchError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    api_error(status, err.to_string())
}

fn to_history(messages: Vec<Message>) -> HistoryResponse {
    let history = messages
        .into_iter()
        .map(|m| HistoryEntry {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
                Role::ToolResult => "tool_result",
            }
            .to_string(),
            content: m.content,
        })
        .collect();
    HistoryResponse { history }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn chat_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state
        .coordinator
        .get_history(&user_id)
        .await
        .map_err(to_api_error)?;
    Ok(Json(to_history(messages)))
}

async fn chat(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message is required"));
    }
    tracing::info!(session = %user_id, chars = message.chars().count(), "chat request");
    let identity = Identity::new(user_id.clone());
    let response = state
        .coordinator
        .post_turn(&user_id, &identity, message)
        .await
        .map_err(to_api_error)?;
    Ok(Json(ChatResponse {
        response,
        role: "assistant".to_string(),
    }))
}

async fn init_chat(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state
        .coordinator
        .initialize_session(&user_id)
        .await
        .map_err(to_api_error)?;
    Ok(Json(to_history(messages)))
}

/// 构建路由
pub fn router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat_history/:user_id", get(chat_history))
        .route("/api/chat/:user_id", post(chat))
        .route("/api/init_chat/:user_id", post(init_chat))
        .with_state(AppState { coordinator })
}

/// 绑定地址并运行，直到 Ctrl+C
pub async fn serve(addr: SocketAddr, coordinator: Arc<SessionCoordinator>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        })
        .await
}
