//! SQLite 存储后端
//!
//! 关系型实现：每张表都有显式的 `expires_at` 列，读取时过滤，列会话时顺手清理。
//! 阻塞调用放在 `spawn_blocking` 里，连接由 r2d2 池管理。

use crate::adapter::{StoreAdapter, StoreBackend};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    now_millis, ApprovalResolution, ApprovalStatus, CommandApprovalRequest, CommandEvent,
    QueueTarget, QueuedMessage, RelayMessage, Session,
};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 审批与事件记录的保留时长
const RECORD_TTL_MS: i64 = 24 * 60 * 60 * 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    pc_device_id TEXT,
    pc_last_seen_at INTEGER,
    pc_pin_hash TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS session_mobiles (
    session_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    PRIMARY KEY (session_id, device_id)
);
CREATE TABLE IF NOT EXISTS device_bindings (
    device_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS queued_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    target TEXT NOT NULL,
    payload TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queued_messages_target
    ON queued_messages(session_id, target, seq);
CREATE TABLE IF NOT EXISTS approvals (
    approval_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_approvals_session
    ON approvals(session_id, created_at DESC);
CREATE TABLE IF NOT EXISTS command_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    approval_id TEXT,
    timestamp INTEGER NOT NULL,
    payload TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_command_events_session
    ON command_events(session_id, timestamp DESC);
";

/// SQLite 存储
pub struct SqliteStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteStore {
    /// 打开文件数据库
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
            }
        }

        info!("[SqliteStore] Opening database: {:?}", path);
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder().build(manager)?;
        Self::with_pool(Arc::new(pool))
    }

    /// 内存数据库（单连接，测试用）
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::with_pool(Arc::new(pool))
    }

    /// 使用已有连接池，自动建表
    pub fn with_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> StoreResult<Self> {
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    /// 在阻塞线程上执行
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn purge_expired(conn: &Connection, now: i64) -> StoreResult<()> {
    let sessions = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
    conn.execute(
        "DELETE FROM session_mobiles WHERE session_id NOT IN (SELECT session_id FROM sessions)",
        [],
    )?;
    conn.execute("DELETE FROM device_bindings WHERE expires_at <= ?1", params![now])?;
    conn.execute("DELETE FROM queued_messages WHERE expires_at <= ?1", params![now])?;
    conn.execute("DELETE FROM approvals WHERE expires_at <= ?1", params![now])?;
    conn.execute("DELETE FROM command_events WHERE expires_at <= ?1", params![now])?;
    if sessions > 0 {
        debug!("[SqliteStore] Purged {} expired sessions", sessions);
    }
    Ok(())
}

fn load_mobiles(conn: &Connection, session_id: &str) -> StoreResult<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT device_id FROM session_mobiles WHERE session_id = ?1")?;
    let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<BTreeSet<_>, _>>()?)
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        pc_device_id: row.get(1)?,
        pc_last_seen_at: row.get(2)?,
        pc_pin_hash: row.get(3)?,
        mobile_device_ids: BTreeSet::new(),
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

const SESSION_COLUMNS: &str =
    "session_id, pc_device_id, pc_last_seen_at, pc_pin_hash, created_at, expires_at";

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(payload)?)
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    async fn ping(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn create_session(&self, session: &Session) -> StoreResult<bool> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let now = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // 过期的同名会话不算冲突
            tx.execute(
                "DELETE FROM sessions WHERE session_id = ?1 AND expires_at <= ?2",
                params![session.session_id, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO sessions (session_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3)",
                params![session.session_id, session.created_at, session.expires_at],
            )?;
            if inserted == 1 {
                tx.execute(
                    "DELETE FROM session_mobiles WHERE session_id = ?1",
                    params![session.session_id],
                )?;
            }
            tx.commit()?;

            Ok(inserted == 1)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM sessions WHERE session_id = ?1 AND expires_at > ?2",
                SESSION_COLUMNS
            );
            let session = conn
                .query_row(&sql, params![session_id, now_millis()], session_from_row)
                .optional()?;

            match session {
                Some(mut session) => {
                    session.mobile_device_ids = load_mobiles(conn, &session.session_id)?;
                    Ok(Some(session))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        self.with_conn(|conn| {
            let now = now_millis();
            purge_expired(conn, now)?;

            let sql = format!("SELECT {} FROM sessions WHERE expires_at > ?1", SESSION_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let mut sessions = stmt
                .query_map(params![now], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare("SELECT session_id, device_id FROM session_mobiles")?;
            let mut mobiles: HashMap<String, BTreeSet<String>> = HashMap::new();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (session_id, device_id) = row?;
                mobiles.entry(session_id).or_default().insert(device_id);
            }

            for session in sessions.iter_mut() {
                if let Some(set) = mobiles.remove(&session.session_id) {
                    session.mobile_device_ids = set;
                }
            }
            Ok(sessions)
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )?;
            tx.execute(
                "DELETE FROM session_mobiles WHERE session_id = ?1",
                params![session_id],
            )?;
            tx.execute(
                "DELETE FROM queued_messages WHERE session_id = ?1",
                params![session_id],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn set_pc(
        &self,
        session_id: &str,
        device_id: &str,
        pin_hash: Option<&str>,
        seen_at: i64,
        expires_at: i64,
    ) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let device_id = device_id.to_string();
        let pin_hash = pin_hash.map(str::to_string);
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions
                 SET pc_device_id = ?1, pc_last_seen_at = ?2, pc_pin_hash = ?3, expires_at = ?4
                 WHERE session_id = ?5 AND expires_at > ?6",
                params![device_id, seen_at, pin_hash, expires_at, session_id, now_millis()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn clear_pc(&self, session_id: &str, device_id: &str) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions
                 SET pc_device_id = NULL, pc_last_seen_at = NULL, pc_pin_hash = NULL
                 WHERE session_id = ?1 AND pc_device_id = ?2",
                params![session_id, device_id],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn touch_pc(&self, session_id: &str, device_id: &str, seen_at: i64) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET pc_last_seen_at = ?1
                 WHERE session_id = ?2 AND pc_device_id = ?3 AND expires_at > ?4",
                params![seen_at, session_id, device_id, now_millis()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn add_mobile(
        &self,
        session_id: &str,
        device_id: &str,
        expires_at: i64,
    ) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let renewed = tx.execute(
                "UPDATE sessions SET expires_at = ?1 WHERE session_id = ?2 AND expires_at > ?3",
                params![expires_at, session_id, now_millis()],
            )?;
            if renewed == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT OR IGNORE INTO session_mobiles (session_id, device_id) VALUES (?1, ?2)",
                params![session_id, device_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn remove_mobile(&self, session_id: &str, device_id: &str) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM session_mobiles WHERE session_id = ?1 AND device_id = ?2",
                params![session_id, device_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn bind_device(
        &self,
        device_id: &str,
        session_id: &str,
        expires_at: i64,
    ) -> StoreResult<()> {
        let device_id = device_id.to_string();
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO device_bindings (device_id, session_id, expires_at)
                 VALUES (?1, ?2, ?3)",
                params![device_id, session_id, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn device_session(&self, device_id: &str) -> StoreResult<Option<String>> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let session_id = conn
                .query_row(
                    "SELECT session_id FROM device_bindings WHERE device_id = ?1 AND expires_at > ?2",
                    params![device_id, now_millis()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(session_id)
        })
        .await
    }

    async fn push_message(
        &self,
        session_id: &str,
        target: &QueueTarget,
        message: &RelayMessage,
        expires_at: i64,
    ) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let target = target.key_suffix();
        let payload = serde_json::to_string(&QueuedMessage {
            message: message.clone(),
            expires_at,
        })?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queued_messages (session_id, target, payload, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, target, payload, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn pop_messages(
        &self,
        session_id: &str,
        target: &QueueTarget,
        limit: usize,
    ) -> StoreResult<Vec<RelayMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let session_id = session_id.to_string();
        let target = target.key_suffix();
        self.with_conn(move |conn| {
            let now = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT seq, payload FROM queued_messages
                     WHERE session_id = ?1 AND target = ?2 AND expires_at > ?3
                     ORDER BY seq ASC LIMIT ?4",
                )?;
                let rows = stmt
                    .query_map(params![session_id, target, now, limit as i64], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            {
                let mut delete = tx.prepare("DELETE FROM queued_messages WHERE seq = ?1")?;
                for (seq, _) in &rows {
                    delete.execute(params![seq])?;
                }
            }
            tx.execute(
                "DELETE FROM queued_messages
                 WHERE session_id = ?1 AND target = ?2 AND expires_at <= ?3",
                params![session_id, target, now],
            )?;
            tx.commit()?;

            let mut messages = Vec::with_capacity(rows.len());
            for (seq, payload) in rows {
                match parse_payload::<QueuedMessage>(&payload) {
                    Ok(record) => messages.push(record.message),
                    Err(e) => warn!("[SqliteStore] Skipping malformed queue row {}: {}", seq, e),
                }
            }
            Ok(messages)
        })
        .await
    }

    async fn has_messages(&self, session_id: &str, target: &QueueTarget) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let target = target.key_suffix();
        self.with_conn(move |conn| {
            let exists: i64 = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM queued_messages
                    WHERE session_id = ?1 AND target = ?2 AND expires_at > ?3
                 )",
                params![session_id, target, now_millis()],
                |row| row.get(0),
            )?;
            Ok(exists != 0)
        })
        .await
    }

    async fn clear_queue(&self, session_id: &str, target: &QueueTarget) -> StoreResult<usize> {
        let session_id = session_id.to_string();
        let target = target.key_suffix();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM queued_messages WHERE session_id = ?1 AND target = ?2",
                params![session_id, target],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn insert_approval(&self, request: &CommandApprovalRequest) -> StoreResult<()> {
        let payload = serde_json::to_string(request)?;
        let request = request.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO approvals (approval_id, session_id, status, payload, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request.approval_id,
                    request.session_id,
                    request.status.as_str(),
                    payload,
                    request.created_at,
                    request.created_at + RECORD_TTL_MS,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<CommandApprovalRequest>> {
        let approval_id = approval_id.to_string();
        self.with_conn(move |conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM approvals WHERE approval_id = ?1 AND expires_at > ?2",
                    params![approval_id, now_millis()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            payload.map(|p| parse_payload(&p)).transpose()
        })
        .await
    }

    async fn resolve_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> StoreResult<Option<CommandApprovalRequest>> {
        let resolution = resolution.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let payload = tx
                .query_row(
                    "SELECT payload FROM approvals WHERE approval_id = ?1 AND status = 'pending'",
                    params![resolution.approval_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            let Some(payload) = payload else {
                return Ok(None);
            };

            let current: CommandApprovalRequest = parse_payload(&payload)?;
            let next = current.resolved(&resolution);
            let next_payload = serde_json::to_string(&next)?;

            // 条件写入：只有仍是 pending 的行才会被更新
            let updated = tx.execute(
                "UPDATE approvals SET status = ?1, payload = ?2
                 WHERE approval_id = ?3 AND status = 'pending'",
                params![next.status.as_str(), next_payload, resolution.approval_id],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            tx.commit()?;
            Ok(Some(next))
        })
        .await
    }

    async fn list_approvals(
        &self,
        session_id: &str,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> StoreResult<Vec<CommandApprovalRequest>> {
        let session_id = session_id.to_string();
        let status = status.map(|s| s.as_str());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM approvals
                 WHERE session_id = ?1 AND (?2 IS NULL OR status = ?2) AND expires_at > ?3
                 ORDER BY created_at DESC, rowid DESC LIMIT ?4",
            )?;
            let payloads = stmt
                .query_map(params![session_id, status, now_millis(), limit as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            payloads.iter().map(|p| parse_payload(p)).collect()
        })
        .await
    }

    async fn append_event(&self, event: &CommandEvent) -> StoreResult<()> {
        let payload = serde_json::to_string(event)?;
        let event_id = event.event_id.clone();
        let session_id = event.session_id.clone();
        let approval_id = event.approval_id().map(str::to_string);
        let timestamp = event.timestamp;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO command_events
                 (event_id, session_id, approval_id, timestamp, payload, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event_id,
                    session_id,
                    approval_id,
                    timestamp,
                    payload,
                    now_millis() + RECORD_TTL_MS,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_events(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> StoreResult<Vec<CommandEvent>> {
        let session_id = session_id.to_string();
        let approval_id = approval_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM command_events
                 WHERE session_id = ?1 AND (?2 IS NULL OR approval_id = ?2) AND expires_at > ?3
                 ORDER BY timestamp DESC, seq DESC LIMIT ?4",
            )?;
            let payloads = stmt
                .query_map(
                    params![session_id, approval_id, now_millis(), limit as i64],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            payloads.iter().map(|p| parse_payload(p)).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_create_session_is_create_if_absent() {
        contract::create_session_is_create_if_absent(&store()).await;
    }

    #[tokio::test]
    async fn test_expired_session_is_invisible_and_replaceable() {
        contract::expired_session_is_invisible_and_replaceable(&store()).await;
    }

    #[tokio::test]
    async fn test_membership_updates() {
        contract::membership_updates(&store()).await;
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_destructive() {
        contract::queue_is_fifo_and_destructive(&store()).await;
    }

    #[tokio::test]
    async fn test_queues_are_isolated_per_target() {
        contract::queues_are_isolated_per_target(&store()).await;
    }

    #[tokio::test]
    async fn test_expired_messages_are_dropped() {
        contract::expired_messages_are_dropped(&store()).await;
    }

    #[tokio::test]
    async fn test_resolve_approval_only_once() {
        contract::resolve_approval_only_once(&store()).await;
    }

    #[tokio::test]
    async fn test_list_approvals_filters_and_orders() {
        contract::list_approvals_filters_and_orders(&store()).await;
    }

    #[tokio::test]
    async fn test_list_events_newest_first_with_filter() {
        contract::list_events_newest_first_with_filter(&store()).await;
    }

    #[tokio::test]
    async fn test_device_binding() {
        contract::device_binding(&store()).await;
    }

    #[tokio::test]
    async fn test_expired_sessions_are_purged_from_listing() {
        let store = store();
        let now = now_millis();
        store
            .create_session(&Session::new(
                "OLD234".to_string(),
                now - 2 * contract::HOUR_MS,
                now - contract::HOUR_MS,
            ))
            .await
            .unwrap();
        contract::with_session(&store, "NEW234").await;

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "NEW234");
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            contract::with_session(&store, "FILE23").await;
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.get_session("FILE23").await.unwrap().is_some());
        assert_eq!(reopened.backend(), StoreBackend::Sqlite);
        reopened.ping().await.unwrap();
    }
}
