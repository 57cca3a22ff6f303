//! 存储适配器接口
//!
//! Redis（TTL key）与 SQLite（显式过期列）实现同一个 trait，进程启动时按配置选定一次。
//! 所有写操作都是单 key / 单行原子操作，不存在跨实体事务。

use crate::error::StoreResult;
use crate::types::{
    ApprovalResolution, ApprovalStatus, CommandApprovalRequest, CommandEvent, QueueTarget,
    RelayMessage, Session,
};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Sqlite,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => f.write_str("redis"),
            StoreBackend::Sqlite => f.write_str("sqlite"),
        }
    }
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// 后端类型
    fn backend(&self) -> StoreBackend;

    /// 连通性检查
    async fn ping(&self) -> StoreResult<()>;

    // ==================== Session ====================

    /// 不存在时创建，已存在返回 false（不覆盖）
    async fn create_session(&self, session: &Session) -> StoreResult<bool>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// 所有未过期会话
    async fn list_sessions(&self) -> StoreResult<Vec<Session>>;

    async fn delete_session(&self, session_id: &str) -> StoreResult<bool>;

    /// 设置 PC 成员（pin_hash 为 None 时清除 PIN），同时续期
    async fn set_pc(
        &self,
        session_id: &str,
        device_id: &str,
        pin_hash: Option<&str>,
        seen_at: i64,
        expires_at: i64,
    ) -> StoreResult<bool>;

    /// 仅当 device_id 是当前 PC 时清除
    async fn clear_pc(&self, session_id: &str, device_id: &str) -> StoreResult<bool>;

    /// 仅当 device_id 是当前 PC 时刷新 last seen
    async fn touch_pc(&self, session_id: &str, device_id: &str, seen_at: i64) -> StoreResult<bool>;

    /// 加入 mobile 集合（幂等），同时续期
    async fn add_mobile(&self, session_id: &str, device_id: &str, expires_at: i64)
        -> StoreResult<bool>;

    async fn remove_mobile(&self, session_id: &str, device_id: &str) -> StoreResult<bool>;

    // ==================== 设备绑定 ====================

    async fn bind_device(&self, device_id: &str, session_id: &str, expires_at: i64)
        -> StoreResult<()>;

    async fn device_session(&self, device_id: &str) -> StoreResult<Option<String>>;

    // ==================== 消息队列 ====================

    async fn push_message(
        &self,
        session_id: &str,
        target: &QueueTarget,
        message: &RelayMessage,
        expires_at: i64,
    ) -> StoreResult<()>;

    /// 原子弹出最旧的最多 limit 条，已过期的记录直接丢弃
    async fn pop_messages(
        &self,
        session_id: &str,
        target: &QueueTarget,
        limit: usize,
    ) -> StoreResult<Vec<RelayMessage>>;

    async fn has_messages(&self, session_id: &str, target: &QueueTarget) -> StoreResult<bool>;

    async fn clear_queue(&self, session_id: &str, target: &QueueTarget) -> StoreResult<usize>;

    // ==================== 审批 ====================

    async fn insert_approval(&self, request: &CommandApprovalRequest) -> StoreResult<()>;

    async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<CommandApprovalRequest>>;

    /// pending → 终态的单次条件写入；请求已不是 pending 时返回 None
    async fn resolve_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> StoreResult<Option<CommandApprovalRequest>>;

    /// 按创建时间倒序
    async fn list_approvals(
        &self,
        session_id: &str,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> StoreResult<Vec<CommandApprovalRequest>>;

    // ==================== 命令事件 ====================

    async fn append_event(&self, event: &CommandEvent) -> StoreResult<()>;

    /// 按时间倒序
    async fn list_events(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> StoreResult<Vec<CommandEvent>>;
}
