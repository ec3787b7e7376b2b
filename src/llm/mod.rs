//! LLM 层：决策单元抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{EchoDecider, RecordedRequest, ScriptedDecider};
pub use openai::{OpenAiDecider, TokenUsage};
pub use traits::{Decider, Decision, DecisionRequest};
