//! Relay 存储层
//!
//! - `StoreAdapter`: 会话 / 队列 / 审批 / 命令事件的持久化接口
//! - `RedisStore`: Redis 后端（TTL key）
//! - `SqliteStore`: SQLite 后端（显式过期列）

pub mod adapter;
#[cfg(test)]
mod contract;
pub mod error;
pub mod redis_store;
pub mod sqlite_store;
pub mod types;

pub use adapter::{StoreAdapter, StoreBackend};
pub use error::{StoreError, StoreResult};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use sqlite_store::SqliteStore;
pub use types::*;
