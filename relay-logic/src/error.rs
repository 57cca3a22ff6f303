//! 业务错误定义

use relay_store::{ApprovalStatus, PolicySnapshot, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Approval not found")]
    ApprovalNotFound,

    #[error("PIN_REQUIRED")]
    PinRequired,

    #[error("INVALID_PIN")]
    InvalidPin,

    #[error("{0}")]
    Forbidden(String),

    #[error("COMMAND_DENIED")]
    CommandDenied(Box<PolicySnapshot>),

    #[error("Approval already {}", .0.as_str())]
    AlreadyResolved(ApprovalStatus),

    #[error("Failed to allocate a session id after {0} attempts")]
    SessionIdExhausted(usize),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        RelayError::Forbidden(message.into())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
