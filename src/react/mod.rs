//! 认知层：turn loop 状态机与过程事件

pub mod events;
pub mod loop_;

pub use events::TurnEvent;
pub use loop_::{run_turn, DecisionBudget, StepCheckpoint, TurnContext};
