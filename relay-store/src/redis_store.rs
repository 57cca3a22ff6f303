//! Redis 存储后端
//!
//! 会话、队列、审批、事件都落在带 TTL 的 key 上，过期由 Redis 自己回收。
//!
//! Key 布局（前缀默认 `relay:`）：
//! - `session:{id}` hash，`session:{id}:mobiles` set，`sessions` 索引 set
//! - `device:{deviceId}` 设备 → 会话绑定
//! - `queue:{session}:{target}` list，元素带独立过期时间
//! - `approval:{id}` JSON，`approval:{id}:resolved` 决议守卫，`approvals:{session}` id list
//! - `events:{session}` list（新事件在头部，按上限裁剪）

use crate::adapter::{StoreAdapter, StoreBackend};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    now_millis, ApprovalResolution, ApprovalStatus, CommandApprovalRequest, CommandEvent,
    QueueTarget, QueuedMessage, RelayMessage, Session,
};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Redis 存储配置
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub key_prefix: String,
    /// 审批与事件记录的保留时长（秒）
    pub record_ttl_secs: u64,
    /// 每个会话保留的事件条数上限
    pub event_history_limit: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            // 从环境变量读取，默认 localhost
            host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(6379),
            password: std::env::var("REDIS_PASSWORD").ok(),
            key_prefix: "relay:".to_string(),
            record_ttl_secs: 24 * 60 * 60,
            event_history_limit: 1000,
        }
    }
}

impl RedisStoreConfig {
    pub fn url(&self) -> String {
        if let Some(ref password) = self.password {
            format!("redis://:{}@{}:{}", password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }
}

/// Redis 存储
pub struct RedisStore {
    client: Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
    config: RedisStoreConfig,
}

impl RedisStore {
    /// 创建存储（不连接）
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url())?;

        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(None)),
            config,
        })
    }

    /// 创建并连接
    pub async fn connect_with(config: RedisStoreConfig) -> StoreResult<Self> {
        let store = Self::new(config)?;
        store.connect().await?;
        Ok(store)
    }

    /// 连接 Redis
    pub async fn connect(&self) -> StoreResult<()> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        *self.conn.write().await = Some(conn);
        info!(
            "[RedisStore] Connected to Redis at {}:{}",
            self.config.host, self.config.port
        );

        Ok(())
    }

    /// 断开连接
    pub async fn disconnect(&self) {
        *self.conn.write().await = None;
        info!("[RedisStore] Disconnected");
    }

    /// 获取连接
    async fn get_conn(&self) -> StoreResult<MultiplexedConnection> {
        let guard = self.conn.read().await;
        guard.clone().ok_or(StoreError::NotConnected)
    }

    /// 守卫已持有时写入决议；审批不存在会释放守卫，已是终态则保留
    async fn write_resolution(
        &self,
        conn: &mut MultiplexedConnection,
        resolution: &ApprovalResolution,
    ) -> StoreResult<Option<CommandApprovalRequest>> {
        let key = self.approval_key(&resolution.approval_id);
        let value: Option<String> = conn.get(&key).await?;
        let current: CommandApprovalRequest = match value {
            Some(v) => serde_json::from_str(&v)?,
            None => {
                let _: () = conn
                    .del(self.approval_guard_key(&resolution.approval_id))
                    .await?;
                return Ok(None);
            }
        };
        if current.status.is_terminal() {
            return Ok(None);
        }

        let next = current.resolved(resolution);
        let payload = serde_json::to_string(&next)?;
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("KEEPTTL")
            .query_async(conn)
            .await?;

        Ok(Some(next))
    }

    // ==================== Key 构建 ====================

    fn session_key(&self, session_id: &str) -> String {
        format!("{}session:{}", self.config.key_prefix, session_id)
    }

    fn mobiles_key(&self, session_id: &str) -> String {
        format!("{}session:{}:mobiles", self.config.key_prefix, session_id)
    }

    fn sessions_index_key(&self) -> String {
        format!("{}sessions", self.config.key_prefix)
    }

    fn device_key(&self, device_id: &str) -> String {
        format!("{}device:{}", self.config.key_prefix, device_id)
    }

    fn queue_key(&self, session_id: &str, target: &QueueTarget) -> String {
        format!(
            "{}queue:{}:{}",
            self.config.key_prefix,
            session_id,
            target.key_suffix()
        )
    }

    fn approval_key(&self, approval_id: &str) -> String {
        format!("{}approval:{}", self.config.key_prefix, approval_id)
    }

    fn approval_guard_key(&self, approval_id: &str) -> String {
        format!("{}approval:{}:resolved", self.config.key_prefix, approval_id)
    }

    fn approvals_key(&self, session_id: &str) -> String {
        format!("{}approvals:{}", self.config.key_prefix, session_id)
    }

    fn events_key(&self, session_id: &str) -> String {
        format!("{}events:{}", self.config.key_prefix, session_id)
    }

    /// 读取单个会话的 hash + mobile 集合
    async fn load_session(
        &self,
        conn: &mut MultiplexedConnection,
        session_id: &str,
    ) -> StoreResult<Option<Session>> {
        let fields: HashMap<String, String> = conn.hgetall(self.session_key(session_id)).await?;
        if !fields.contains_key("session_id") || !fields.contains_key("created_at") {
            return Ok(None);
        }

        let mobiles: Vec<String> = conn.smembers(self.mobiles_key(session_id)).await?;
        let session = session_from_hash(&fields, mobiles)?;
        if session.expires_at <= now_millis() {
            return Ok(None);
        }
        Ok(Some(session))
    }
}

fn parse_millis(fields: &HashMap<String, String>, name: &str) -> StoreResult<Option<i64>> {
    match fields.get(name) {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| StoreError::Corrupt(format!("session field {} = {:?}", name, raw))),
        None => Ok(None),
    }
}

fn session_from_hash(fields: &HashMap<String, String>, mobiles: Vec<String>) -> StoreResult<Session> {
    let session_id = fields
        .get("session_id")
        .cloned()
        .ok_or_else(|| StoreError::Corrupt("session hash without session_id".to_string()))?;

    Ok(Session {
        session_id,
        pc_device_id: fields.get("pc_device_id").cloned(),
        pc_last_seen_at: parse_millis(fields, "pc_last_seen_at")?,
        pc_pin_hash: fields.get("pc_pin_hash").cloned(),
        mobile_device_ids: mobiles.into_iter().collect(),
        created_at: parse_millis(fields, "created_at")?.unwrap_or_default(),
        expires_at: parse_millis(fields, "expires_at")?.unwrap_or_default(),
    })
}

#[async_trait]
impl StoreAdapter for RedisStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let key = self.session_key(&session.session_id);

        // HSETNX 抢占 session_id 字段，已存在则放弃，不覆盖
        let created: bool = conn.hset_nx(&key, "session_id", &session.session_id).await?;
        if !created {
            debug!("[RedisStore] Session {} already exists", session.session_id);
            return Ok(false);
        }

        let fields = [
            ("created_at", session.created_at.to_string()),
            ("expires_at", session.expires_at.to_string()),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .pexpire_at(&key, session.expires_at)
            .ignore()
            .sadd(self.sessions_index_key(), &session.session_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(true)
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.get_conn().await?;
        self.load_session(&mut conn, session_id).await
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut conn = self.get_conn().await?;
        let ids: Vec<String> = conn.smembers(self.sessions_index_key()).await?;

        let mut sessions = Vec::new();
        let mut stale = Vec::new();
        for id in ids {
            match self.load_session(&mut conn, &id).await? {
                Some(session) => sessions.push(session),
                None => stale.push(id),
            }
        }

        // 索引里残留的过期会话顺手清掉
        if !stale.is_empty() {
            debug!("[RedisStore] Pruning {} expired sessions from index", stale.len());
            let _: () = conn.srem(self.sessions_index_key(), &stale).await?;
        }

        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let (removed, _, _): (i64, i64, i64) = redis::pipe()
            .atomic()
            .del(self.session_key(session_id))
            .del(self.mobiles_key(session_id))
            .srem(self.sessions_index_key(), session_id)
            .query_async(&mut conn)
            .await?;

        Ok(removed > 0)
    }

    async fn set_pc(
        &self,
        session_id: &str,
        device_id: &str,
        pin_hash: Option<&str>,
        seen_at: i64,
        expires_at: i64,
    ) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let key = self.session_key(session_id);

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(false);
        }

        let fields = [
            ("pc_device_id", device_id.to_string()),
            ("pc_last_seen_at", seen_at.to_string()),
            ("expires_at", expires_at.to_string()),
        ];
        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&key, &fields).ignore();
        match pin_hash {
            Some(hash) => {
                pipe.hset(&key, "pc_pin_hash", hash).ignore();
            }
            None => {
                pipe.hdel(&key, "pc_pin_hash").ignore();
            }
        }
        pipe.pexpire_at(&key, expires_at)
            .ignore()
            .pexpire_at(self.mobiles_key(session_id), expires_at)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(true)
    }

    async fn clear_pc(&self, session_id: &str, device_id: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let key = self.session_key(session_id);

        let current: Option<String> = conn.hget(&key, "pc_device_id").await?;
        if current.as_deref() != Some(device_id) {
            return Ok(false);
        }

        let _: () = conn
            .hdel(&key, &["pc_device_id", "pc_last_seen_at", "pc_pin_hash"][..])
            .await?;
        Ok(true)
    }

    async fn touch_pc(&self, session_id: &str, device_id: &str, seen_at: i64) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let key = self.session_key(session_id);

        let current: Option<String> = conn.hget(&key, "pc_device_id").await?;
        if current.as_deref() != Some(device_id) {
            return Ok(false);
        }

        let _: () = conn.hset(&key, "pc_last_seen_at", seen_at).await?;
        Ok(true)
    }

    async fn add_mobile(
        &self,
        session_id: &str,
        device_id: &str,
        expires_at: i64,
    ) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let key = self.session_key(session_id);
        let mobiles = self.mobiles_key(session_id);

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(false);
        }

        let _: () = redis::pipe()
            .atomic()
            .sadd(&mobiles, device_id)
            .ignore()
            .hset(&key, "expires_at", expires_at)
            .ignore()
            .pexpire_at(&key, expires_at)
            .ignore()
            .pexpire_at(&mobiles, expires_at)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(true)
    }

    async fn remove_mobile(&self, session_id: &str, device_id: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let removed: i64 = conn.srem(self.mobiles_key(session_id), device_id).await?;
        Ok(removed > 0)
    }

    async fn bind_device(
        &self,
        device_id: &str,
        session_id: &str,
        expires_at: i64,
    ) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let ttl_ms = (expires_at - now_millis()).max(1) as u64;
        let _: () = conn.pset_ex(self.device_key(device_id), session_id, ttl_ms).await?;
        Ok(())
    }

    async fn device_session(&self, device_id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(self.device_key(device_id)).await?;
        Ok(value)
    }

    async fn push_message(
        &self,
        session_id: &str,
        target: &QueueTarget,
        message: &RelayMessage,
        expires_at: i64,
    ) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let key = self.queue_key(session_id, target);
        let record = QueuedMessage {
            message: message.clone(),
            expires_at,
        };
        let payload = serde_json::to_string(&record)?;

        let _: () = redis::pipe()
            .atomic()
            .rpush(&key, payload)
            .ignore()
            .pexpire_at(&key, expires_at)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("[RedisStore] Queued message {} -> {}", message.id, key);
        Ok(())
    }

    async fn pop_messages(
        &self,
        session_id: &str,
        target: &QueueTarget,
        limit: usize,
    ) -> StoreResult<Vec<RelayMessage>> {
        let Some(count) = NonZeroUsize::new(limit) else {
            return Ok(Vec::new());
        };

        let mut conn = self.get_conn().await?;
        let key = self.queue_key(session_id, target);
        let raw: Option<Vec<String>> = conn.lpop(&key, Some(count)).await?;

        let now = now_millis();
        let mut messages = Vec::new();
        for item in raw.unwrap_or_default() {
            match serde_json::from_str::<QueuedMessage>(&item) {
                Ok(record) if record.expires_at > now => messages.push(record.message),
                Ok(record) => {
                    debug!("[RedisStore] Dropping expired message {}", record.message.id)
                }
                Err(e) => warn!("[RedisStore] Skipping malformed queue entry in {}: {}", key, e),
            }
        }

        Ok(messages)
    }

    async fn has_messages(&self, session_id: &str, target: &QueueTarget) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let items: Vec<String> = conn.lrange(self.queue_key(session_id, target), 0, -1).await?;

        let now = now_millis();
        Ok(items.iter().any(|item| {
            serde_json::from_str::<QueuedMessage>(item)
                .map(|record| record.expires_at > now)
                .unwrap_or(false)
        }))
    }

    async fn clear_queue(&self, session_id: &str, target: &QueueTarget) -> StoreResult<usize> {
        let mut conn = self.get_conn().await?;
        let key = self.queue_key(session_id, target);
        let (len, _): (usize, i64) = redis::pipe()
            .atomic()
            .llen(&key)
            .del(&key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn insert_approval(&self, request: &CommandApprovalRequest) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let ttl = self.config.record_ttl_secs;
        let index = self.approvals_key(&request.session_id);
        let payload = serde_json::to_string(request)?;

        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.approval_key(&request.approval_id), payload, ttl)
            .ignore()
            .lpush(&index, &request.approval_id)
            .ignore()
            .expire(&index, ttl as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<CommandApprovalRequest>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(self.approval_key(approval_id)).await?;
        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    async fn resolve_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> StoreResult<Option<CommandApprovalRequest>> {
        let mut conn = self.get_conn().await?;
        let guard_key = self.approval_guard_key(&resolution.approval_id);

        // SET NX 守卫：同一审批只有第一个决议者能继续写入
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&guard_key)
            .arg(resolution.status.as_str())
            .arg("NX")
            .arg("EX")
            .arg(self.config.record_ttl_secs)
            .query_async(&mut conn)
            .await?;
        if acquired.is_none() {
            debug!(
                "[RedisStore] Approval {} already resolved by another caller",
                resolution.approval_id
            );
            return Ok(None);
        }

        // 持有守卫期间出错必须释放守卫
        let written = self.write_resolution(&mut conn, resolution).await;
        if written.is_err() {
            let released: redis::RedisResult<()> = conn.del(&guard_key).await;
            if let Err(e) = released {
                warn!(
                    "[RedisStore] Failed to release resolve guard {}: {}",
                    guard_key, e
                );
            }
        }
        written
    }

    async fn list_approvals(
        &self,
        session_id: &str,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> StoreResult<Vec<CommandApprovalRequest>> {
        let mut conn = self.get_conn().await?;
        let ids: Vec<String> = conn.lrange(self.approvals_key(session_id), 0, -1).await?;

        let mut approvals = Vec::new();
        for id in ids {
            if approvals.len() >= limit {
                break;
            }
            let value: Option<String> = conn.get(self.approval_key(&id)).await?;
            let Some(value) = value else { continue };
            match serde_json::from_str::<CommandApprovalRequest>(&value) {
                Ok(request) => {
                    if request.session_id == session_id
                        && status.map_or(true, |s| request.status == s)
                    {
                        approvals.push(request);
                    }
                }
                Err(e) => warn!("[RedisStore] Skipping malformed approval {}: {}", id, e),
            }
        }

        Ok(approvals)
    }

    async fn append_event(&self, event: &CommandEvent) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        let key = self.events_key(&event.session_id);
        let payload = serde_json::to_string(event)?;
        let keep = self.config.event_history_limit.max(1) as isize;

        let _: () = redis::pipe()
            .atomic()
            .lpush(&key, payload)
            .ignore()
            .ltrim(&key, 0, keep - 1)
            .ignore()
            .expire(&key, self.config.record_ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> StoreResult<Vec<CommandEvent>> {
        let mut conn = self.get_conn().await?;
        let items: Vec<String> = conn.lrange(self.events_key(session_id), 0, -1).await?;

        let mut events: Vec<CommandEvent> = items
            .iter()
            .filter_map(|item| match serde_json::from_str::<CommandEvent>(item) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("[RedisStore] Skipping malformed event: {}", e);
                    None
                }
            })
            .filter(|event| approval_id.map_or(true, |id| event.approval_id() == Some(id)))
            .collect();

        // 列表按写入顺序倒序，时间戳可能来自客户端，再按时间排一次
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }
}
