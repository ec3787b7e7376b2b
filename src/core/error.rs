//! 调度错误类型
//!
//! 与 RecoveryInspector / SessionCoordinator 配合：哪些错误终止整轮、哪些作为 tool_result 回灌给决策单元。

use thiserror::Error;

/// 调度核心可能出现的错误（锁竞争、存储冲突、工具失败、决策循环超限等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// ToolGateway 被调用时没有调用方身份
    #[error("Caller identity missing for tool: {0}")]
    IdentityMissing(String),

    /// 同一会话已有一轮在处理中
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// CompareAndSwap 被拒绝：存储版本已被其它写入者推进
    #[error("Store conflict on {key}: expected version {expected}, found {current}")]
    StoreConflict {
        key: String,
        expected: u64,
        current: u64,
    },

    /// 有限次重试后仍无法写入
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Decision loop exceeded {0} cycles")]
    DecisionLoopExceeded(usize),

    #[error("Tool {tool} transient error: {message}")]
    ToolTransient { tool: String, message: String },

    #[error("Tool {tool} permanent error: {message}")]
    ToolPermanent { tool: String, message: String },

    /// 决策单元（LLM）调用失败
    #[error("Decision error: {0}")]
    Decision(String),

    /// 请求级超时
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// 存储后端故障（IO、SQL、序列化）
    #[error("Store error: {0}")]
    Store(String),

    /// 模型请求了当前节点不可达的能力
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl DispatchError {
    /// 是否终止整轮（其余错误在工具层被转换为 tool_result 内容）
    pub fn is_turn_fatal(&self) -> bool {
        matches!(self, DispatchError::DecisionLoopExceeded(_))
    }

    /// 调用方是否可以退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::SessionBusy(_)
                | DispatchError::Unavailable(_)
                | DispatchError::Timeout(_)
                | DispatchError::ToolTransient { .. }
        )
    }

    /// 将工具层失败渲染为 tool_result 内容，供决策单元决定重试或致歉
    pub fn as_tool_result(&self) -> String {
        match self {
            DispatchError::ToolTransient { tool, message } => format!(
                "Error: tool `{tool}` is temporarily unavailable ({message}). You may retry."
            ),
            DispatchError::ToolPermanent { tool, message } => format!(
                "Error: tool `{tool}` failed ({message}). Retrying will not help."
            ),
            DispatchError::IdentityMissing(tool) => format!(
                "Error: caller identity missing; `{tool}` was not executed."
            ),
            DispatchError::UnknownCapability(name) => {
                format!("Error: `{name}` is not an available tool or agent.")
            }
            other => format!("Error: {other}"),
        }
    }
}
