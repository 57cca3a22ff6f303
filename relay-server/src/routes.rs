//! HTTP 路由处理
//!
//! 请求体 / 查询参数都是 camelCase，缺字段统一返回 400。

use crate::envelope::{ok, with_status, ApiError};
use crate::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use relay_logic::{ApprovalAction, NewCommandEvent, PollRequest, SendOutcome, SendRequest};
use relay_store::DeviceType;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

type ApiResult = Result<Response, ApiError>;

/// 列表接口默认条数
const DEFAULT_LIST_LIMIT: usize = 50;

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{} is required", name)))
}

fn device_type(value: &Option<String>) -> Result<DeviceType, ApiError> {
    required(value, "deviceType")?
        .parse::<DeviceType>()
        .map_err(ApiError::bad_request)
}

fn list_limit(state: &AppState, limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, state.service.config().event_history_limit.max(1))
}

// ==================== Session ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

pub async fn create_session(State(state): State<AppState>) -> ApiResult {
    let session = state.service.sessions().create().await?;
    Ok(with_status(StatusCode::CREATED, session))
}

pub async fn get_session(
    State(state): State<AppState>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let session_id = required(&query.session_id, "sessionId")?;
    Ok(ok(state.service.sessions().get(session_id).await?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let session_id = required(&query.session_id, "sessionId")?;
    state.service.sessions().delete(session_id).await?;
    Ok(ok(json!({ "sessionId": session_id, "deleted": true })))
}

// ==================== Connect / Disconnect ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBody {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub pin: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    body: Result<Json<ConnectBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let session_id = required(&body.session_id, "sessionId")?;
    let device_id = required(&body.device_id, "deviceId")?;
    let device_type = device_type(&body.device_type)?;

    let session = state
        .service
        .sessions()
        .join(session_id, device_id, device_type, body.pin.as_deref())
        .await?;
    Ok(ok(session))
}

pub async fn disconnect(
    State(state): State<AppState>,
    body: Result<Json<ConnectBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let device_id = required(&body.device_id, "deviceId")?;
    let device_type = device_type(&body.device_type)?;
    let session_id = state
        .service
        .sessions()
        .resolve_session_id(body.session_id.as_deref(), Some(device_id))
        .await?;

    let session = state
        .service
        .sessions()
        .leave(&session_id, device_id, device_type)
        .await?;
    Ok(ok(session))
}

// ==================== Send / Poll / Heartbeat ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub data: Option<Value>,
}

pub async fn send(
    State(state): State<AppState>,
    body: Result<Json<SendBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let request = SendRequest {
        device_id: required(&body.device_id, "deviceId")?.to_string(),
        device_type: device_type(&body.device_type)?,
        message_type: required(&body.message_type, "type")?.to_string(),
        session_id: body.session_id,
        data: body.data.unwrap_or(Value::Null),
    };

    match state.service.send(request).await? {
        SendOutcome::Queued { message, policy } => Ok(ok(json!({
            "queued": true,
            "messageId": message.id,
            "timestamp": message.timestamp,
            "policy": policy,
        }))),
        SendOutcome::PendingApproval { approval } => {
            info!(
                "[Api] Message held for approval {} in {}",
                approval.approval_id, approval.session_id
            );
            Ok(with_status(
                StatusCode::ACCEPTED,
                json!({
                    "queued": false,
                    "approvalRequired": true,
                    "approvalId": approval.approval_id,
                    "policy": approval.policy,
                }),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub limit: Option<usize>,
}

impl PollQuery {
    pub fn into_request(self) -> Result<PollRequest, ApiError> {
        Ok(PollRequest {
            device_type: device_type(&self.device_type)?,
            session_id: self.session_id,
            device_id: self.device_id,
            limit: self.limit,
        })
    }
}

pub async fn poll(
    State(state): State<AppState>,
    query: Result<Query<PollQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let outcome = state.service.poll(query.into_request()?).await?;
    Ok(ok(json!({
        "sessionId": outcome.session_id,
        "count": outcome.messages.len(),
        "messages": outcome.messages,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatQuery {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    query: Result<Query<HeartbeatQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let device_id = required(&query.device_id, "deviceId")?;
    let session_id = state
        .service
        .sessions()
        .resolve_session_id(query.session_id.as_deref(), Some(device_id))
        .await?;

    let session = state
        .service
        .sessions()
        .heartbeat(&session_id, device_id)
        .await?;
    Ok(ok(json!({
        "sessionId": session.session_id,
        "pcLastSeenAt": session.pc_last_seen_at,
        "expiresAt": session.expires_at,
    })))
}

// ==================== Approvals ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalsQuery {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_approvals(
    State(state): State<AppState>,
    query: Result<Query<ApprovalsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let session_id = required(&query.session_id, "sessionId")?;
    let limit = list_limit(&state, query.limit);
    Ok(ok(state.service.pending_approvals(session_id, limit).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveBody {
    pub session_id: Option<String>,
    pub approval_id: Option<String>,
    pub action: Option<String>,
    pub resolved_by: Option<String>,
    pub reason: Option<String>,
}

pub async fn resolve_approval(
    State(state): State<AppState>,
    body: Result<Json<ResolveBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let session_id = required(&body.session_id, "sessionId")?;
    let approval_id = required(&body.approval_id, "approvalId")?;
    let action: ApprovalAction = required(&body.action, "action")?.parse()?;

    let approval = state
        .service
        .resolve_approval(session_id, approval_id, action, body.resolved_by, body.reason)
        .await?;
    Ok(ok(approval))
}

// ==================== Command events ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
    pub approval_id: Option<String>,
}

pub async fn list_command_events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let session_id = required(&query.session_id, "sessionId")?;
    let limit = list_limit(&state, query.limit);
    let approval_id = query.approval_id.as_deref().filter(|id| !id.is_empty());

    let events = state
        .service
        .command_events(session_id, limit, approval_id)
        .await?;
    Ok(ok(events))
}

#[derive(Debug, Deserialize)]
pub struct AppendEventBody {
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub event: NewCommandEvent,
}

pub async fn append_command_event(
    State(state): State<AppState>,
    body: Result<Json<AppendEventBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let session_id = required(&body.session_id, "sessionId")?;
    let event = state.service.append_event(session_id, body.event).await?;
    Ok(with_status(StatusCode::CREATED, event))
}

pub async fn timeline_summary(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let session_id = required(&query.session_id, "sessionId")?;
    let limit = list_limit(&state, query.limit);
    let approval_id = query.approval_id.as_deref().filter(|id| !id.is_empty());

    let rows = state
        .service
        .timeline_summary(session_id, limit, approval_id)
        .await?;
    Ok(ok(rows))
}

// ==================== Discovery ====================

pub async fn sessions_waiting_for_pc(State(state): State<AppState>) -> ApiResult {
    let sessions = state.service.sessions().find_sessions_waiting_for_pc().await?;
    Ok(ok(sessions))
}

pub async fn sessions_with_mobile(State(state): State<AppState>) -> ApiResult {
    let sessions = state.service.sessions().find_sessions_with_mobile().await?;
    Ok(ok(sessions))
}

// ==================== Introspection ====================

pub async fn health(State(state): State<AppState>) -> ApiResult {
    Ok(ok(json!({
        "status": "ok",
        "backend": state.service.backend(),
    })))
}

pub async fn store_info(State(state): State<AppState>) -> ApiResult {
    state.service.ping().await?;
    let config = state.service.config();
    Ok(ok(json!({
        "backend": state.service.backend(),
        "connected": true,
        "sessionTtlMs": config.session_ttl_ms(),
        "messageTtlMs": config.message_ttl_ms(),
        "pollMaxBatch": config.poll_max_batch,
    })))
}

// ==================== Fallbacks ====================

pub async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}
