//! 统一响应格式 `{success, data?, error?, timestamp}`

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_logic::RelayError;
use relay_store::now_millis;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_millis(),
        }
    }
}

/// 200 + data
pub fn ok<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

/// 指定状态码 + data
pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse::ok(data))).into_response()
}

/// 错误响应
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            data: self.data,
            error: Some(self.message),
            timestamp: now_millis(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Validation(message) => ApiError::bad_request(message),
            RelayError::SessionNotFound | RelayError::ApprovalNotFound => {
                ApiError::not_found(err.to_string())
            }
            RelayError::PinRequired | RelayError::InvalidPin | RelayError::Forbidden(_) => {
                ApiError::new(StatusCode::FORBIDDEN, err.to_string())
            }
            RelayError::CommandDenied(policy) => ApiError {
                status: StatusCode::FORBIDDEN,
                message: "COMMAND_DENIED".to_string(),
                data: Some(json!({ "policy": policy })),
            },
            RelayError::AlreadyResolved(_) => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            RelayError::SessionIdExhausted(_) | RelayError::Store(_) => {
                // 细节只进日志
                error!("[Api] Internal error: {}", err);
                ApiError::internal()
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(format!("Invalid JSON body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::bad_request(format!("Invalid query: {}", rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::{PolicyDecision, PolicySnapshot, RiskLevel, StoreError};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RelayError::validation("x"), StatusCode::BAD_REQUEST),
            (RelayError::SessionNotFound, StatusCode::NOT_FOUND),
            (RelayError::ApprovalNotFound, StatusCode::NOT_FOUND),
            (RelayError::PinRequired, StatusCode::FORBIDDEN),
            (RelayError::InvalidPin, StatusCode::FORBIDDEN),
            (RelayError::forbidden("x"), StatusCode::FORBIDDEN),
            (
                RelayError::AlreadyResolved(relay_store::ApprovalStatus::Approved),
                StatusCode::CONFLICT,
            ),
            (RelayError::SessionIdExhausted(5), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let err = RelayError::Store(StoreError::ConnectionFailed(
            "redis://:secret@host:6379".to_string(),
        ));
        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.message.contains("secret"));
    }

    #[test]
    fn test_denied_carries_policy() {
        let err = RelayError::CommandDenied(Box::new(PolicySnapshot {
            risk_level: RiskLevel::Critical,
            reasons: vec!["power control".to_string()],
            decision: PolicyDecision::Deny,
            rule_id: "critical.power".to_string(),
        }));
        let api = ApiError::from(err);
        assert_eq!(api.message, "COMMAND_DENIED");
        assert_eq!(
            api.data.unwrap()["policy"]["rule_id"],
            "critical.power"
        );
    }
}
