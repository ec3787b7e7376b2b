//! 核心层：错误分类、调用方身份、轮次状态、会话锁、恢复检查、会话协调

pub mod coordinator;
pub mod error;
pub mod identity;
pub mod recovery;
pub mod session_lock;
pub mod state;

pub use coordinator::{default_seed, CoordinatorSettings, SessionCoordinator, LOOP_FAILURE_NOTICE};
pub use error::DispatchError;
pub use identity::Identity;
pub use recovery::{repair, RecoveryInspector, INTERRUPTED_TOOL_RESULT};
pub use session_lock::{LockMode, SessionGuard, SessionLocks};
pub use state::TurnPhase;
