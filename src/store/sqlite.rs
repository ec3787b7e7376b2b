//! SQLite 检查点存储（sqlx，需要 `async-sqlite` feature）
//!
//! 每个会话一行：版本号、JSON 序列化的消息列表、过期时间（毫秒时间戳）。
//! CompareAndSwap 通过 `WHERE version = ?` 条件更新实现，过期行视为不存在。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::CheckpointStore;
use crate::core::DispatchError;
use crate::memory::{Message, SessionLog};

fn store_err(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Store(e.to_string())
}

/// SQLite 检查点存储
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    ttl_ms: Option<i64>,
}

impl SqliteCheckpointStore {
    pub async fn new(db_path: impl AsRef<Path>, ttl_secs: Option<u64>) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self::from_pool(pool, ttl_secs);
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool, ttl_secs: Option<u64>) -> Self {
        Self {
            pool,
            ttl_ms: ttl_secs.map(|s| (s as i64).saturating_mul(1000)),
        }
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_checkpoints (
                session_key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                messages TEXT NOT NULL,
                expires_at INTEGER,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_version(&self, key: &str, now: i64) -> Result<u64, DispatchError> {
        let row = sqlx::query(
            "SELECT version FROM session_checkpoints
             WHERE session_key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64).unwrap_or(0))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, key: &str) -> Result<SessionLog, DispatchError> {
        let now = chrono::Utc::now().timestamp_millis();
        let row = sqlx::query(
            "SELECT version, messages FROM session_checkpoints
             WHERE session_key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let Some(row) = row else {
            // 读到的若是过期行，顺手删除
            sqlx::query(
                "DELETE FROM session_checkpoints
                 WHERE session_key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
            )
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
            return Ok(SessionLog::default());
        };
        let version: i64 = row.get("version");
        let raw: String = row.get("messages");
        let messages: Vec<Message> = serde_json::from_str(&raw).map_err(store_err)?;
        Ok(SessionLog::new(messages, version as u64))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        messages: &[Message],
    ) -> Result<u64, DispatchError> {
        let now = chrono::Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at = self.ttl_ms.map(|ttl| now_ms + ttl);
        let raw = serde_json::to_string(messages).map_err(store_err)?;
        let new_version = expected_version + 1;

        let result = if expected_version == 0 {
            // 不存在或已过期的行才允许从 0 写入
            sqlx::query(
                "INSERT INTO session_checkpoints (session_key, version, messages, expires_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(session_key) DO UPDATE SET
                    version = excluded.version,
                    messages = excluded.messages,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                 WHERE session_checkpoints.expires_at IS NOT NULL
                   AND session_checkpoints.expires_at <= ?",
            )
            .bind(key)
            .bind(new_version as i64)
            .bind(&raw)
            .bind(expires_at)
            .bind(now.to_rfc3339())
            .bind(now_ms)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE session_checkpoints
                 SET version = ?, messages = ?, expires_at = ?, updated_at = ?
                 WHERE session_key = ? AND version = ?
                   AND (expires_at IS NULL OR expires_at > ?)",
            )
            .bind(new_version as i64)
            .bind(&raw)
            .bind(expires_at)
            .bind(now.to_rfc3339())
            .bind(key)
            .bind(expected_version as i64)
            .bind(now_ms)
            .execute(&self.pool)
            .await
        }
        .map_err(store_err)?;

        if result.rows_affected() == 1 {
            return Ok(new_version);
        }
        let current = self.current_version(key, now_ms).await?;
        Err(DispatchError::StoreConflict {
            key: key.to_string(),
            expected: expected_version,
            current,
        })
    }

    async fn purge_expired(&self) -> Result<u64, DispatchError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "DELETE FROM session_checkpoints WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}
