//! 会话协调器
//!
//! 一次外部请求：获取会话锁 -> RecoveryInspector 读取并修复 -> （可选压缩）-> 追加 user 消息 ->
//! 入口节点 turn loop -> CompareAndSwap 持久化 -> 释放锁 -> 返回回答。
//! 请求级超时在下一个挂起点中止本轮，只保留最后一次成功持久化的版本。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::recovery::{repair, INTERRUPTED_TOOL_RESULT};
use crate::core::session_lock::{LockMode, SessionLocks};
use crate::core::{DispatchError, Identity, RecoveryInspector};
use crate::dispatch::DispatchHierarchy;
use crate::memory::{dangling_tool_calls, Compactor, Message, SessionLog};
use crate::react::{run_turn, StepCheckpoint, TurnContext, TurnEvent};
use crate::store::CheckpointStore;

/// 决策循环超限时写入日志的通用失败回复
pub const LOOP_FAILURE_NOTICE: &str =
    "Sorry, I could not finish handling this request. Please try again or rephrase it.";

/// 新会话的默认种子历史
pub fn default_seed() -> Vec<Message> {
    vec![
        Message::user("我的订单怎么还没到？"),
        Message::assistant("请告诉我你要查询的订单号？"),
    ]
}

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub lock_mode: LockMode,
    /// Queue 模式下的最长等待
    pub lock_wait: Duration,
    /// 整轮超时；None 表示不限
    pub request_timeout: Option<Duration>,
    /// CompareAndSwap 冲突后的最大尝试次数
    pub cas_attempts: usize,
    /// 根节点每次追加后立即持久化
    pub checkpoint_each_step: bool,
    pub seed: Vec<Message>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Queue,
            lock_wait: Duration::from_secs(30),
            request_timeout: Some(Duration::from_secs(120)),
            cas_attempts: 3,
            checkpoint_each_step: false,
            seed: default_seed(),
        }
    }
}

/// 会话协调器：多会话共享，内部无全局锁
pub struct SessionCoordinator {
    store: Arc<dyn CheckpointStore>,
    hierarchy: Arc<DispatchHierarchy>,
    recovery: RecoveryInspector,
    locks: SessionLocks,
    compactor: Option<Compactor>,
    settings: CoordinatorSettings,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        hierarchy: Arc<DispatchHierarchy>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            recovery: RecoveryInspector::new(Arc::clone(&store), settings.cas_attempts),
            locks: SessionLocks::new(settings.lock_mode, settings.lock_wait),
            store,
            hierarchy,
            compactor: None,
            settings,
        }
    }

    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn hierarchy(&self) -> &Arc<DispatchHierarchy> {
        &self.hierarchy
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// 对外历史（只读，过滤内部消息）
    pub async fn get_history(&self, key: &str) -> Result<Vec<Message>, DispatchError> {
        Ok(self.store.load(key).await?.visible_history())
    }

    /// 初始化会话：已有非空日志时不做任何写入
    pub async fn initialize_session(&self, key: &str) -> Result<Vec<Message>, DispatchError> {
        let _guard = self.locks.acquire(key).await?;
        let log = self.store.load(key).await?;
        if !log.is_empty() || self.settings.seed.is_empty() {
            return Ok(log.visible_history());
        }
        match self.store.compare_and_swap(key, 0, &self.settings.seed).await {
            Ok(version) => {
                tracing::info!(session = key, version, "session seeded");
                Ok(SessionLog::new(self.settings.seed.clone(), version).visible_history())
            }
            Err(DispatchError::StoreConflict { .. }) => {
                Ok(self.store.load(key).await?.visible_history())
            }
            Err(e) => Err(e),
        }
    }

    /// 处理一轮用户输入，返回入口节点的最终回答
    pub async fn post_turn(
        &self,
        key: &str,
        identity: &Identity,
        text: &str,
    ) -> Result<String, DispatchError> {
        self.post_turn_with_events(key, identity, text, None).await
    }

    /// 同 [`Self::post_turn`]，并把过程事件推送到 events
    pub async fn post_turn_with_events(
        &self,
        key: &str,
        identity: &Identity,
        text: &str,
        events: Option<UnboundedSender<TurnEvent>>,
    ) -> Result<String, DispatchError> {
        let _guard = self.locks.acquire(key).await?;
        let turn = self.run_locked(key, identity, text, events.clone());
        let result = match self.settings.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, turn).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(session = key, timeout_ms = limit.as_millis() as u64, "turn timed out");
                    Err(DispatchError::Timeout(limit.as_millis() as u64))
                }
            },
            None => turn.await,
        };
        if let (Err(e), Some(tx)) = (&result, &events) {
            let _ = tx.send(TurnEvent::Failure { text: e.to_string() });
        }
        result
    }

    async fn run_locked(
        &self,
        key: &str,
        identity: &Identity,
        text: &str,
        events: Option<UnboundedSender<TurnEvent>>,
    ) -> Result<String, DispatchError> {
        let mut log = self.recovery.inspect(key).await?;
        let mut writer = LogWriter {
            store: self.store.as_ref(),
            key,
            version: log.version,
            persisted_len: log.len(),
            synced_len: None,
            attempts: self.settings.cas_attempts.max(1),
        };

        if let Some(compactor) = &self.compactor {
            match compactor.compact(&mut log).await {
                // 压缩后的前缀随本轮一起写入；冲突时随新读取的日志一起丢弃
                Ok(true) => writer.persisted_len = log.len(),
                Ok(false) => {}
                Err(e) => tracing::warn!(session = key, error = %e, "compaction skipped"),
            }
        }

        let mut messages = log.messages;
        messages.push(Message::user(text));

        let mut ctx = TurnContext::new(
            identity.clone(),
            self.hierarchy.settings().max_decision_cycles,
        );
        if let Some(tx) = events {
            ctx = ctx.with_events(tx);
        }

        let step: Option<&mut dyn StepCheckpoint> = if self.settings.checkpoint_each_step {
            Some(&mut writer)
        } else {
            None
        };
        let outcome = run_turn(
            &self.hierarchy,
            self.hierarchy.entry(),
            &mut messages,
            &ctx,
            step,
        )
        .await;

        match outcome {
            Ok(answer) => {
                let version = writer.commit(&mut messages).await?;
                tracing::info!(session = key, version, messages = messages.len(), "turn committed");
                Ok(answer)
            }
            Err(e) if e.is_turn_fatal() => {
                // 闭合可能残留的调用后写入通用失败回复，日志仍满足配对约束
                repair(&mut messages);
                messages.push(Message::assistant(LOOP_FAILURE_NOTICE));
                let version = writer.commit(&mut messages).await?;
                tracing::warn!(session = key, version, error = %e, "turn aborted");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(session = key, error = %e, "turn failed, nothing committed");
                Err(e)
            }
        }
    }
}

/// 本轮日志的写入者：记录基准版本与本轮之前的前缀长度
struct LogWriter<'s> {
    store: &'s dyn CheckpointStore,
    key: &'s str,
    version: u64,
    /// messages[persisted_len..] 是本轮尚未持久化的消息，冲突时只重放这一段
    persisted_len: usize,
    /// 最近一次成功写入时的长度；turn loop 只追加，长度相同即内容相同
    synced_len: Option<usize>,
    attempts: usize,
}

impl LogWriter<'_> {
    /// CompareAndSwap 写入；冲突时重新读取、闭合新日志、重放本轮新增消息后重试
    async fn commit(&mut self, messages: &mut Vec<Message>) -> Result<u64, DispatchError> {
        if self.synced_len == Some(messages.len()) {
            return Ok(self.version);
        }
        for attempt in 1..=self.attempts {
            match self
                .store
                .compare_and_swap(self.key, self.version, messages)
                .await
            {
                Ok(version) => {
                    self.version = version;
                    self.persisted_len = messages.len();
                    self.synced_len = Some(messages.len());
                    return Ok(version);
                }
                Err(DispatchError::StoreConflict { current, .. }) => {
                    tracing::warn!(
                        session = self.key,
                        attempt,
                        expected = self.version,
                        current,
                        "checkpoint conflict, replaying turn onto fresh log"
                    );
                    let fresh = self.store.load(self.key).await?;
                    let tail = messages.split_off(self.persisted_len.min(messages.len()));
                    let answered: HashSet<&str> = tail
                        .iter()
                        .filter_map(|m| m.tool_call_id.as_deref())
                        .collect();
                    let mut merged = fresh.messages;
                    let missing: Vec<Message> = dangling_tool_calls(&merged)
                        .into_iter()
                        .filter(|c| !answered.contains(c.id.as_str()))
                        .map(|c| Message::tool_result(c.id.clone(), INTERRUPTED_TOOL_RESULT))
                        .collect();
                    merged.extend(missing);
                    self.persisted_len = merged.len();
                    merged.extend(tail);
                    *messages = merged;
                    self.version = fresh.version;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DispatchError::Unavailable(format!(
            "session {} could not be checkpointed after {} attempts",
            self.key, self.attempts
        )))
    }
}

#[async_trait]
impl StepCheckpoint for LogWriter<'_> {
    async fn checkpoint(&mut self, messages: &mut Vec<Message>) -> Result<(), DispatchError> {
        self.commit(messages).await.map(|_| ())
    }
}
