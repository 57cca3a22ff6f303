//! 中继服务
//!
//! 把会话、队列、策略、审批、账本组装在一起，HTTP 层只和这里打交道。

use crate::approval::{ApprovalAction, ApprovalWorkflow};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::ledger::{command_id_for, command_raw_for, CommandEventLedger, NewCommandEvent};
use crate::policy::{evaluate, EXECUTE_COMMAND};
use crate::queue::MessageQueue;
use crate::session::SessionStore;
use crate::timeline::{summarize, TimelineRow};
use relay_store::{
    now_millis, CommandApprovalRequest, CommandEvent, DeviceType, EventApproval, EventCommand,
    EventPolicy, EventResult, EventRisk, EventTool, PolicyDecision, PolicySnapshot, RelayMessage,
    ResultStatus, Session, StoreAdapter, StoreBackend,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// 发送请求
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_id: Option<String>,
    pub device_id: String,
    pub device_type: DeviceType,
    pub message_type: String,
    pub data: Value,
}

/// 发送结果
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// 已入队
    Queued {
        message: RelayMessage,
        policy: PolicySnapshot,
    },
    /// 被扣留，等待审批
    PendingApproval { approval: CommandApprovalRequest },
}

/// 拉取请求
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub device_type: DeviceType,
    pub limit: Option<usize>,
}

/// 拉取结果
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub session_id: String,
    pub messages: Vec<RelayMessage>,
}

pub struct RelayService {
    config: Arc<RelayConfig>,
    store: Arc<dyn StoreAdapter>,
    sessions: SessionStore,
    queue: Arc<MessageQueue>,
    approvals: ApprovalWorkflow,
    ledger: Arc<CommandEventLedger>,
}

impl RelayService {
    pub fn new(store: Arc<dyn StoreAdapter>, config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let sessions = SessionStore::new(store.clone(), config.clone());
        let queue = Arc::new(MessageQueue::new(store.clone(), config.clone()));
        let ledger = Arc::new(CommandEventLedger::new(store.clone(), config.clone()));
        let approvals = ApprovalWorkflow::new(store.clone(), queue.clone(), ledger.clone());

        info!("[RelayService] Using {} store", store.backend());
        Self {
            config,
            store,
            sessions,
            queue,
            approvals,
            ledger,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn approvals(&self) -> &ApprovalWorkflow {
        &self.approvals
    }

    pub fn ledger(&self) -> &CommandEventLedger {
        &self.ledger
    }

    pub fn backend(&self) -> StoreBackend {
        self.store.backend()
    }

    pub async fn ping(&self) -> RelayResult<()> {
        Ok(self.store.ping().await?)
    }

    /// 发送消息
    ///
    /// execute_command 先过策略：allow 入队，approval_required 转审批，deny 拒绝。
    /// 每次 execute_command 都会记一条命令事件。
    pub async fn send(&self, request: SendRequest) -> RelayResult<SendOutcome> {
        let device_id = request.device_id.trim();
        if device_id.is_empty() {
            return Err(RelayError::validation("deviceId is required"));
        }
        let message_type = request.message_type.trim();
        if message_type.is_empty() {
            return Err(RelayError::validation("type is required"));
        }
        let data = match request.data {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(RelayError::validation("data must be an object")),
        };

        let session_id = self
            .sessions
            .resolve_session_id(request.session_id.as_deref(), Some(device_id))
            .await?;
        let session = self.sessions.get(&session_id).await?;
        ensure_member(&session, device_id, request.device_type)?;

        let message = RelayMessage {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.to_string(),
            from: request.device_type,
            to: request.device_type.opposite(),
            data,
            timestamp: now_millis(),
        };

        let policy = evaluate(&message.message_type, command_raw_for(&message));
        let is_command = message.message_type == EXECUTE_COMMAND;

        match policy.decision {
            PolicyDecision::Deny => {
                warn!(
                    "[RelayService] Command denied in {} from {} (rule={})",
                    session_id, device_id, policy.rule_id
                );
                if is_command {
                    self.ledger
                        .record(&send_event(&session_id, device_id, &message, &policy, None))
                        .await?;
                }
                Err(RelayError::CommandDenied(Box::new(policy)))
            }
            PolicyDecision::ApprovalRequired => {
                let approval = self
                    .approvals
                    .request_approval(&session_id, &message, policy.clone(), device_id)
                    .await?;
                self.ledger
                    .record(&send_event(
                        &session_id,
                        device_id,
                        &message,
                        &policy,
                        Some(&approval.approval_id),
                    ))
                    .await?;
                Ok(SendOutcome::PendingApproval { approval })
            }
            PolicyDecision::Allow => {
                self.queue.enqueue(&session, &message).await?;
                if is_command {
                    self.ledger
                        .record(&send_event(&session_id, device_id, &message, &policy, None))
                        .await?;
                }
                Ok(SendOutcome::Queued { message, policy })
            }
        }
    }

    /// 拉取消息；PC 带上自己的 deviceId 时顺便刷新在线时间
    pub async fn poll(&self, request: PollRequest) -> RelayResult<PollOutcome> {
        let device_id = request
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        let session_id = self
            .sessions
            .resolve_session_id(request.session_id.as_deref(), device_id)
            .await?;
        let session = self.sessions.get(&session_id).await?;

        if let (DeviceType::Pc, Some(device_id)) = (request.device_type, device_id) {
            self.sessions.touch_if_pc(&session, device_id).await?;
        }

        let messages = self
            .queue
            .dequeue(&session_id, request.device_type, request.limit, device_id)
            .await?;
        Ok(PollOutcome {
            session_id,
            messages,
        })
    }

    /// PC 挂在长轮询上时刷新在线时间；不是当前 PC 时什么都不做
    pub async fn refresh_presence(
        &self,
        session_id: &str,
        device_type: DeviceType,
        device_id: Option<&str>,
    ) -> RelayResult<bool> {
        let session = self.sessions.get(session_id).await?;
        match (device_type, device_id.map(str::trim).filter(|id| !id.is_empty())) {
            (DeviceType::Pc, Some(device_id)) => {
                self.sessions.touch_if_pc(&session, device_id).await
            }
            _ => Ok(false),
        }
    }

    /// 不消费地检查是否有消息（长轮询用）
    pub async fn has_pending(
        &self,
        session_id: &str,
        device_type: DeviceType,
        device_id: Option<&str>,
    ) -> RelayResult<bool> {
        self.queue.has_pending(session_id, device_type, device_id).await
    }

    pub async fn resolve_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        action: ApprovalAction,
        resolved_by: Option<String>,
        reason: Option<String>,
    ) -> RelayResult<CommandApprovalRequest> {
        self.approvals
            .resolve(session_id, approval_id, action, resolved_by, reason)
            .await
    }

    pub async fn pending_approvals(
        &self,
        session_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<CommandApprovalRequest>> {
        self.sessions.get(session_id).await?;
        self.approvals.list_pending(session_id, limit).await
    }

    pub async fn append_event(
        &self,
        session_id: &str,
        input: NewCommandEvent,
    ) -> RelayResult<CommandEvent> {
        self.ledger.append(session_id, input).await
    }

    /// 投影后的事件，新的在前
    pub async fn command_events(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> RelayResult<Vec<CommandEvent>> {
        self.ledger.list_projected(session_id, limit, approval_id).await
    }

    /// 命令时间线，每条链一行
    pub async fn timeline_summary(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> RelayResult<Vec<TimelineRow>> {
        let history = self.ledger.projected_history(session_id).await?;
        let approvals = self
            .approvals
            .list_all(session_id, self.config.event_history_limit)
            .await?;

        let rows = match approval_id {
            Some(approval_id) => summarize(&history, &approvals, usize::MAX)
                .into_iter()
                .filter(|row| row.chain_id == approval_id)
                .take(limit)
                .collect(),
            None => summarize(&history, &approvals, limit),
        };
        Ok(rows)
    }
}

fn ensure_member(session: &Session, device_id: &str, device_type: DeviceType) -> RelayResult<()> {
    let joined = match device_type {
        DeviceType::Pc => session.pc_device_id.as_deref() == Some(device_id),
        DeviceType::Mobile => session.mobile_device_ids.contains(device_id),
    };
    if joined {
        Ok(())
    } else {
        Err(RelayError::forbidden("Device is not joined to this session"))
    }
}

/// 发送时记录的命令事件
fn send_event(
    session_id: &str,
    device_id: &str,
    message: &RelayMessage,
    policy: &PolicySnapshot,
    approval_id: Option<&str>,
) -> CommandEvent {
    let mut metadata = Map::new();
    metadata.insert("command_id".to_string(), json!(command_id_for(message)));
    metadata.insert("message_id".to_string(), json!(message.id));
    metadata.insert("message_type".to_string(), json!(message.message_type));
    metadata.insert("sender_device_id".to_string(), json!(device_id));
    metadata.insert("requested_by".to_string(), json!(device_id));
    if let Some(approval_id) = approval_id {
        metadata.insert("approval_id".to_string(), json!(approval_id));
    }

    let required = policy.decision == PolicyDecision::ApprovalRequired;
    let result = match policy.decision {
        PolicyDecision::Deny => EventResult {
            status: ResultStatus::Cancelled,
            error_message: Some(format!("Denied by policy ({})", policy.rule_id)),
            ..Default::default()
        },
        _ => EventResult::default(),
    };

    CommandEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        timestamp: message.timestamp,
        tool: EventTool {
            source: message.from.as_str().to_string(),
            name: Some(message.message_type.clone()),
        },
        command: EventCommand {
            raw: command_raw_for(message).unwrap_or_default().to_string(),
        },
        risk: EventRisk {
            level: policy.risk_level,
            reasons: policy.reasons.clone(),
        },
        policy: EventPolicy {
            decision: policy.decision,
            rule_id: policy.rule_id.clone(),
        },
        approval: EventApproval {
            required,
            status: required.then_some(relay_store::ApprovalStatus::Pending),
            ..Default::default()
        },
        result,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ChainKind;
    use relay_store::{ApprovalStatus, SqliteStore};

    async fn setup() -> (RelayService, String) {
        let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::in_memory().unwrap());
        let service = RelayService::new(store, RelayConfig::default());
        let session_id = service.sessions().create().await.unwrap().session_id;
        service
            .sessions()
            .join(&session_id, "M1", DeviceType::Mobile, None)
            .await
            .unwrap();
        service
            .sessions()
            .join(&session_id, "P1", DeviceType::Pc, None)
            .await
            .unwrap();
        (service, session_id)
    }

    fn send(session_id: &str, message_type: &str, data: Value) -> SendRequest {
        SendRequest {
            session_id: Some(session_id.to_string()),
            device_id: "M1".to_string(),
            device_type: DeviceType::Mobile,
            message_type: message_type.to_string(),
            data,
        }
    }

    fn poll_pc(session_id: &str) -> PollRequest {
        PollRequest {
            session_id: Some(session_id.to_string()),
            device_id: Some("P1".to_string()),
            device_type: DeviceType::Pc,
            limit: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (service, session_id) = setup().await;
        let outcome = service
            .send(send(&session_id, "insert_text", json!({ "text": "hi" })))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Queued { .. }));

        let polled = service.poll(poll_pc(&session_id)).await.unwrap();
        assert_eq!(polled.messages.len(), 1);
        let message = &polled.messages[0];
        assert_eq!(message.message_type, "insert_text");
        assert_eq!(message.data, json!({ "text": "hi" }));
        assert_eq!(message.from, DeviceType::Mobile);
        assert!(!message.id.is_empty());
        assert!(message.timestamp > 0);

        // 非命令消息不记事件
        assert!(service.command_events(&session_id, 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_inferred_from_device_binding() {
        let (service, session_id) = setup().await;
        let mut request = send(&session_id, "insert_text", json!({ "text": "hi" }));
        request.session_id = None;
        service.send(request).await.unwrap();

        let polled = service
            .poll(PollRequest {
                session_id: None,
                ..poll_pc(&session_id)
            })
            .await
            .unwrap();
        assert_eq!(polled.session_id, session_id);
        assert_eq!(polled.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_non_member_cannot_send() {
        let (service, session_id) = setup().await;
        let mut request = send(&session_id, "insert_text", json!({}));
        request.device_id = "M9".to_string();
        assert!(matches!(
            service.send(request).await,
            Err(RelayError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_approval_gate() {
        let (service, session_id) = setup().await;
        let outcome = service
            .send(send(
                &session_id,
                EXECUTE_COMMAND,
                json!({ "commandRaw": "sudo apt upgrade", "command_id": "cmd-1" }),
            ))
            .await
            .unwrap();
        let SendOutcome::PendingApproval { approval } = outcome else {
            panic!("expected approval");
        };
        assert!(service.poll(poll_pc(&session_id)).await.unwrap().messages.is_empty());
        assert_eq!(
            service.pending_approvals(&session_id, 10).await.unwrap().len(),
            1
        );

        service
            .resolve_approval(
                &session_id,
                &approval.approval_id,
                ApprovalAction::Approve,
                Some("M1".into()),
                None,
            )
            .await
            .unwrap();
        let delivered = service.poll(poll_pc(&session_id)).await.unwrap().messages;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data_str("commandRaw"), Some("sudo apt upgrade"));
        assert!(service.poll(poll_pc(&session_id)).await.unwrap().messages.is_empty());

        // PC 上报执行结果，时间线收敛为一条审批链
        let done: NewCommandEvent = serde_json::from_value(json!({
            "command": { "raw": "sudo apt upgrade" },
            "result": { "status": "success", "exit_code": 0 },
            "metadata": { "command_id": "cmd-1" }
        }))
        .unwrap();
        service.append_event(&session_id, done).await.unwrap();

        let events = service
            .command_events(&session_id, 10, Some(&approval.approval_id))
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.result.status == ResultStatus::Success));
        assert!(events
            .iter()
            .all(|e| e.approval.status == Some(ApprovalStatus::Approved)));

        let rows = service.timeline_summary(&session_id, 10, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chain_kind, ChainKind::Approval);
        assert_eq!(rows[0].requested_by.as_deref(), Some("M1"));
        assert_eq!(rows[0].resolved_by.as_deref(), Some("M1"));
        assert_eq!(rows[0].result_status, ResultStatus::Success);
        assert_eq!(rows[0].event_count, 3);
    }

    #[tokio::test]
    async fn test_reject_never_delivers() {
        let (service, session_id) = setup().await;
        let outcome = service
            .send(send(&session_id, EXECUTE_COMMAND, json!({ "command": "git reset --hard" })))
            .await
            .unwrap();
        let SendOutcome::PendingApproval { approval } = outcome else {
            panic!("expected approval");
        };

        service
            .resolve_approval(&session_id, &approval.approval_id, ApprovalAction::Reject, None, Some("no".into()))
            .await
            .unwrap();
        assert!(service.poll(poll_pc(&session_id)).await.unwrap().messages.is_empty());

        let events = service.command_events(&session_id, 10, None).await.unwrap();
        assert!(events.iter().all(|e| e.result.status == ResultStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_denied_command_is_recorded_not_queued() {
        let (service, session_id) = setup().await;
        let result = service
            .send(send(&session_id, EXECUTE_COMMAND, json!({ "command": "rm -rf /" })))
            .await;
        let Err(RelayError::CommandDenied(policy)) = result else {
            panic!("expected deny");
        };
        assert_eq!(policy.decision, PolicyDecision::Deny);
        assert!(service.poll(poll_pc(&session_id)).await.unwrap().messages.is_empty());

        let events = service.command_events(&session_id, 10, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result.status, ResultStatus::Cancelled);
        assert_eq!(events[0].policy.decision, PolicyDecision::Deny);
    }

    #[tokio::test]
    async fn test_allowed_command_records_event() {
        let (service, session_id) = setup().await;
        let outcome = service
            .send(send(&session_id, EXECUTE_COMMAND, json!({ "command": "ls -la" })))
            .await
            .unwrap();
        let SendOutcome::Queued { message, policy } = outcome else {
            panic!("expected queued");
        };
        assert_eq!(policy.rule_id, "safe-command-default-allow");

        let events = service.command_events(&session_id, 10, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command_id(), Some(message.id.as_str()));
        assert_eq!(events[0].metadata_str("sender_device_id"), Some("M1"));
    }

    #[tokio::test]
    async fn test_pc_poll_refreshes_presence() {
        let (service, session_id) = setup().await;
        let before = service.sessions().get(&session_id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        service.poll(poll_pc(&session_id)).await.unwrap();
        let after = service.sessions().get(&session_id).await.unwrap();
        assert!(after.pc_last_seen_at > before.pc_last_seen_at);
    }

    #[tokio::test]
    async fn test_invalid_payloads() {
        let (service, session_id) = setup().await;
        assert!(matches!(
            service.send(send(&session_id, "insert_text", json!([1, 2]))).await,
            Err(RelayError::Validation(_))
        ));
        assert!(matches!(
            service.send(send(&session_id, " ", json!({}))).await,
            Err(RelayError::Validation(_))
        ));
    }
}
