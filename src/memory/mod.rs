//! 记忆层：消息模型、会话日志（配对约束）、可选的上下文压缩

pub mod compaction;
pub mod message;
pub mod session_log;

pub use compaction::{safe_cut, Compactor, DeciderSummarizer, Summarizer};
pub use message::{fresh_call_id, Message, Role, ToolCall};
pub use session_log::{check_pairing, dangling_tool_calls, PairingError, SessionLog};
