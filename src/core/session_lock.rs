//! 会话锁表：同一会话同时至多一轮在处理
//!
//! 锁按需创建并引用计数；最后一个持有者/等待者离开时从表中移除，不存在全局锁。
//! 竞争时按配置排队（有界等待）或直接拒绝，两种情况都以 SessionBusy 告知调用方。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::DispatchError;

/// 锁竞争时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// 排队等待，超过 wait 后返回 SessionBusy
    #[default]
    Queue,
    /// 立即返回 SessionBusy
    Reject,
}

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

type SlotTable = Arc<Mutex<HashMap<String, Slot>>>;

fn table_guard(table: &SlotTable) -> MutexGuard<'_, HashMap<String, Slot>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

fn release(table: &SlotTable, key: &str) {
    let mut slots = table_guard(table);
    if let Some(slot) = slots.get_mut(key) {
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            slots.remove(key);
        }
    }
}

/// 每会话锁表
#[derive(Clone)]
pub struct SessionLocks {
    slots: SlotTable,
    mode: LockMode,
    wait: Duration,
}

impl SessionLocks {
    pub fn new(mode: LockMode, wait: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            mode,
            wait,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// 获取会话锁；返回的 guard 在 drop 时释放
    pub async fn acquire(&self, key: &str) -> Result<SessionGuard, DispatchError> {
        let lock = {
            let mut slots = table_guard(&self.slots);
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };

        let permit = match self.mode {
            LockMode::Reject => lock.try_lock_owned().ok(),
            LockMode::Queue => tokio::time::timeout(self.wait, lock.lock_owned()).await.ok(),
        };

        match permit {
            Some(permit) => Ok(SessionGuard {
                _permit: permit,
                key: key.to_string(),
                slots: Arc::clone(&self.slots),
            }),
            None => {
                release(&self.slots, key);
                tracing::warn!(session = key, mode = ?self.mode, "session busy");
                Err(DispatchError::SessionBusy(key.to_string()))
            }
        }
    }

    /// 当前表中的会话数（持有或等待）
    pub fn active_sessions(&self) -> usize {
        table_guard(&self.slots).len()
    }
}

/// 会话锁持有凭证
pub struct SessionGuard {
    _permit: OwnedMutexGuard<()>,
    key: String,
    slots: SlotTable,
}

impl SessionGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard").field("key", &self.key).finish()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        release(&self.slots, &self.key);
    }
}
