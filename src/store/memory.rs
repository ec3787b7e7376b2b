//! 内存检查点存储（带 TTL）

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CheckpointStore;
use crate::core::DispatchError;
use crate::memory::{Message, SessionLog};

struct Entry {
    messages: Vec<Message>,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// 内存存储：每次成功写入刷新 TTL，过期条目读取时视为不存在
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Option<Duration>,
}

impl MemoryCheckpointStore {
    pub fn new(ttl_secs: Option<u64>) -> Self {
        Self::with_ttl(ttl_secs.map(Duration::from_secs))
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// 存活会话数
    pub async fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|e| e.is_live(now)).count()
    }

    /// 表中条目数（含尚未清理的过期条目）
    pub async fn stored_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::with_ttl(None)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &str) -> Result<SessionLog, DispatchError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.is_live(now) => {
                    return Ok(SessionLog::new(e.messages.clone(), e.version))
                }
                None => return Ok(SessionLog::default()),
                Some(_) => {}
            }
        }
        // 读到过期条目：顺手删除（期间若已被重新写入则保留）
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(match entries.get(key) {
            Some(e) => SessionLog::new(e.messages.clone(), e.version),
            None => SessionLog::default(),
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        messages: &[Message],
    ) -> Result<u64, DispatchError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        let current = entries.get(key).map_or(0, |e| e.version);
        if current != expected_version {
            return Err(DispatchError::StoreConflict {
                key: key.to_string(),
                expected: expected_version,
                current,
            });
        }
        let version = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                messages: messages.to_vec(),
                version,
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
        Ok(version)
    }

    async fn purge_expired(&self) -> Result<u64, DispatchError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_absent_session_is_empty_at_version_zero() {
        let store = MemoryCheckpointStore::default();
        let log = store.load("u1").await.unwrap();
        assert!(log.is_empty());
        assert_eq!(log.version, 0);
    }

    #[tokio::test]
    async fn test_compare_and_swap_advances_version() {
        let store = MemoryCheckpointStore::default();
        let v1 = store.compare_and_swap("u1", 0, &[Message::user("hi")]).await.unwrap();
        assert_eq!(v1, 1);
        let v2 = store
            .compare_and_swap("u1", 1, &[Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        assert_eq!(v2, 2);
        let log = store.load("u1").await.unwrap();
        assert_eq!(log.version, 2);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_writer_is_rejected() {
        let store = MemoryCheckpointStore::default();
        store.compare_and_swap("u1", 0, &[Message::user("a")]).await.unwrap();
        let err = store
            .compare_and_swap("u1", 0, &[Message::user("b")])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::StoreConflict {
                key: "u1".into(),
                expected: 0,
                current: 1
            }
        );
        assert_eq!(store.load("u1").await.unwrap().messages[0].content, "a");
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_absent() {
        let store = MemoryCheckpointStore::with_ttl(Some(Duration::from_millis(30)));
        store.compare_and_swap("u1", 0, &[Message::user("a")]).await.unwrap();
        assert_eq!(store.live_count().await, 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let log = store.load("u1").await.unwrap();
        assert!(log.is_empty());
        assert_eq!(log.version, 0);
        // 过期后可以从版本 0 重新开始
        assert_eq!(store.compare_and_swap("u1", 0, &[Message::user("b")]).await.unwrap(), 1);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let store = MemoryCheckpointStore::with_ttl(Some(Duration::from_millis(20)));
        store.compare_and_swap("a", 0, &[Message::user("a")]).await.unwrap();
        store.compare_and_swap("b", 0, &[Message::user("b")]).await.unwrap();
        store.compare_and_swap("c", 0, &[Message::user("c")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // 读取时删除
        assert!(store.load("a").await.unwrap().is_empty());
        assert_eq!(store.stored_count().await, 2);
        // 批量清理
        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.stored_count().await, 0);
    }
}
