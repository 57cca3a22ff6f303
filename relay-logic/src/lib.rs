//! Relay 业务逻辑
//!
//! - `SessionStore`: 会话、成员、PIN、在线推断与发现
//! - `MessageQueue`: 按方向的 FIFO 队列
//! - `policy`: 命令风险评估
//! - `ApprovalWorkflow`: 高风险命令的审批
//! - `CommandEventLedger`: 命令事件账本与读时投影
//! - `RelayService`: 以上组件的组合入口

pub mod approval;
pub mod config;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod queue;
pub mod service;
pub mod session;
pub mod timeline;

pub use approval::{ApprovalAction, ApprovalWorkflow};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use ledger::{
    derive_chain_keys, project_final_status, ChainKey, ChainKind, CommandEventLedger,
    CommandIdSource, NewCommandEvent,
};
pub use policy::{evaluate, PolicyResult};
pub use queue::MessageQueue;
pub use service::{PollOutcome, PollRequest, RelayService, SendOutcome, SendRequest};
pub use session::SessionStore;
pub use timeline::{summarize, TimelineRow};
