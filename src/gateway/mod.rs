//! 传输层：HTTP 接口（GetHistory / PostTurn / InitializeSession / 健康检查）

pub mod http;

pub use http::{router, serve, AppState, ChatRequest, ChatResponse, HistoryEntry, HistoryResponse};
