//! 恢复检查器：新工作开始前修复被中途打断的会话日志
//!
//! 若日志最后是携带 ToolCall 且尚无结果的 assistant 消息，为每个悬空调用补一条固定内容的失败 tool_result，
//! 用读取时的版本 CompareAndSwap 持久化；冲突时重新读取并重新检查，不覆盖并发写入。

use std::sync::Arc;

use crate::core::DispatchError;
use crate::memory::{dangling_tool_calls, Message, SessionLog};
use crate::store::CheckpointStore;

/// 悬空调用的补偿结果内容
pub const INTERRUPTED_TOOL_RESULT: &str = "Error: tool execution did not complete; the operation was not confirmed. \
Please retry if it is still needed.";

/// 为尾部悬空的 ToolCall 追加失败结果，返回追加的条数
pub fn repair(messages: &mut Vec<Message>) -> usize {
    let synthesized: Vec<Message> = dangling_tool_calls(messages)
        .into_iter()
        .map(|call| Message::tool_result(call.id.clone(), INTERRUPTED_TOOL_RESULT))
        .collect();
    let n = synthesized.len();
    messages.extend(synthesized);
    n
}

/// 恢复检查器
pub struct RecoveryInspector {
    store: Arc<dyn CheckpointStore>,
    max_attempts: usize,
}

impl RecoveryInspector {
    pub fn new(store: Arc<dyn CheckpointStore>, max_attempts: usize) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 读取并修复会话日志，返回满足配对约束的日志及其当前版本
    pub async fn inspect(&self, key: &str) -> Result<SessionLog, DispatchError> {
        for attempt in 1..=self.max_attempts {
            let mut log = self.store.load(key).await?;
            if log.is_empty() {
                return Ok(log);
            }
            let added = repair(&mut log.messages);
            if added == 0 {
                return Ok(log);
            }
            match self
                .store
                .compare_and_swap(key, log.version, &log.messages)
                .await
            {
                Ok(version) => {
                    tracing::info!(
                        session = key,
                        repaired = added,
                        from = log.version,
                        to = version,
                        "recovered interrupted tool calls"
                    );
                    log.version = version;
                    return Ok(log);
                }
                Err(DispatchError::StoreConflict { current, .. }) => {
                    tracing::warn!(session = key, attempt, current, "recovery raced a concurrent writer, reloading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(DispatchError::Unavailable(format!(
            "recovery for session {key} gave up after {} attempts",
            self.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{check_pairing, Role, ToolCall};
    use crate::store::MemoryCheckpointStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn interrupted() -> Vec<Message> {
        vec![
            Message::user("退款 A1002"),
            Message::assistant_with_calls(
                "",
                vec![
                    ToolCall::from_json("c1", "check_cancelable", json!({"order_no": "A1002"})),
                    ToolCall::from_json("c2", "refund_order", json!({"order_no": "A1002"})),
                ],
            ),
        ]
    }

    #[test]
    fn test_repair_closes_every_dangling_call() {
        let mut messages = interrupted();
        assert_eq!(repair(&mut messages), 2);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(messages[3].content, INTERRUPTED_TOOL_RESULT);
        assert!(check_pairing(&messages).is_ok());
        // 再次修复是 no-op
        assert_eq!(repair(&mut messages), 0);
    }

    #[tokio::test]
    async fn test_inspect_persists_repair_with_one_version_bump() {
        let store = Arc::new(MemoryCheckpointStore::default());
        store.compare_and_swap("u2", 0, &interrupted()).await.unwrap();
        let inspector = RecoveryInspector::new(store.clone(), 3);

        let log = inspector.inspect("u2").await.unwrap();
        assert_eq!(log.version, 2);
        let stored = store.load("u2").await.unwrap();
        assert_eq!(stored.version, 2);
        let last = stored.last().unwrap();
        assert_eq!(last.role, Role::ToolResult);
        assert_eq!(last.tool_call_id.as_deref(), Some("c2"));

        // 已修复的日志不再写入
        assert_eq!(inspector.inspect("u2").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_empty_and_closed_logs_untouched() {
        let store = Arc::new(MemoryCheckpointStore::default());
        let inspector = RecoveryInspector::new(store.clone(), 3);
        assert_eq!(inspector.inspect("nobody").await.unwrap().version, 0);
        store
            .compare_and_swap("u1", 0, &[Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        assert_eq!(inspector.inspect("u1").await.unwrap().version, 1);
    }

    /// 第一次 CAS 前插入一次并发写入
    struct RacingStore {
        inner: MemoryCheckpointStore,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl CheckpointStore for RacingStore {
        async fn load(&self, key: &str) -> Result<SessionLog, DispatchError> {
            self.inner.load(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_version: u64,
            messages: &[Message],
        ) -> Result<u64, DispatchError> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let mut other = self.inner.load(key).await?.messages;
                repair(&mut other);
                other.push(Message::assistant("written by another process"));
                self.inner.compare_and_swap(key, expected_version, &other).await?;
            }
            self.inner.compare_and_swap(key, expected_version, messages).await
        }
    }

    #[tokio::test]
    async fn test_conflict_reloads_instead_of_overwriting() {
        let inner = MemoryCheckpointStore::default();
        inner.compare_and_swap("u3", 0, &interrupted()).await.unwrap();
        let store = Arc::new(RacingStore {
            inner,
            raced: std::sync::atomic::AtomicBool::new(false),
        });
        let inspector = RecoveryInspector::new(store.clone(), 3);
        let log = inspector.inspect("u3").await.unwrap();
        // 并发写入者已闭合日志，检查器接受其结果
        assert_eq!(log.version, 2);
        assert_eq!(log.last().unwrap().content, "written by another process");
    }
}
