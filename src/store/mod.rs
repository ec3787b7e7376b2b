//! 检查点存储抽象层
//!
//! 会话历史唯一的持久真相源：按会话 key 存储带版本的有序消息列表。
//! 写入是乐观并发的 CompareAndSwap，期望版本不符时返回 StoreConflict。

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::StoreSection;
use crate::core::DispatchError;
use crate::memory::{Message, SessionLog};

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

pub use memory::MemoryCheckpointStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 读取会话日志；不存在或已过期时返回版本 0 的空日志
    async fn load(&self, key: &str) -> Result<SessionLog, DispatchError>;

    /// 当存储版本等于 expected_version 时整体替换消息，返回新版本；
    /// 否则返回 [`DispatchError::StoreConflict`]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        messages: &[Message],
    ) -> Result<u64, DispatchError>;

    /// 删除已过期的会话，返回删除数量；无 TTL 的实现无需覆盖
    async fn purge_expired(&self) -> Result<u64, DispatchError> {
        Ok(0)
    }
}

/// 由 TTL 推导清理周期：TTL 的四分之一，限制在 1 秒到 10 分钟之间
pub fn sweep_interval(ttl_secs: u64) -> Duration {
    Duration::from_secs((ttl_secs / 4).clamp(1, 600))
}

/// 后台周期清理过期会话；存储被释放后任务自行退出
pub fn spawn_expiry_sweeper(store: &Arc<dyn CheckpointStore>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<dyn CheckpointStore> = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = weak.upgrade() else {
                break;
            };
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "expired sessions purged"),
                Err(e) => tracing::warn!(error = %e, "failed to purge expired sessions"),
            }
        }
    })
}

/// 创建检查点存储
///
/// backend = "sqlite" 且启用了 async-sqlite feature 时使用 SQLite；否则使用内存存储。
/// 配置了 TTL 时同时启动后台过期清理任务。
pub async fn create_checkpoint_store(cfg: &StoreSection, ttl_secs: Option<u64>) -> Arc<dyn CheckpointStore> {
    let store = open_checkpoint_store(cfg, ttl_secs).await;
    if let Some(ttl) = ttl_secs {
        spawn_expiry_sweeper(&store, sweep_interval(ttl));
    }
    store
}

async fn open_checkpoint_store(cfg: &StoreSection, ttl_secs: Option<u64>) -> Arc<dyn CheckpointStore> {
    #[cfg(feature = "async-sqlite")]
    if cfg.backend == "sqlite" {
        match SqliteCheckpointStore::new(&cfg.sqlite_path, ttl_secs).await {
            Ok(store) => {
                tracing::info!(path = %cfg.sqlite_path.display(), "Using sqlite checkpoint store");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite checkpoint store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if cfg.backend == "sqlite" {
        tracing::warn!("sqlite checkpoint store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory checkpoint store");
    Arc::new(MemoryCheckpointStore::new(ttl_secs))
}
