//! 命令审批流程
//!
//! pending → approved | rejected，只转换一次。
//! 状态写入与审计事件追加是两次独立写入，两者之间的短暂不一致由账本投影兜底。

use crate::error::{RelayError, RelayResult};
use crate::ledger::{command_id_for, command_raw_for, CommandEventLedger};
use crate::queue::MessageQueue;
use relay_store::{
    now_millis, ApprovalResolution, ApprovalStatus, CommandApprovalRequest, CommandEvent,
    EventApproval, EventCommand, EventPolicy, EventResult, EventRisk, EventTool, PolicySnapshot,
    RelayMessage, ResultStatus, StoreAdapter,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 审批动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalAction::Approve => "approve",
            ApprovalAction::Reject => "reject",
        }
    }

    fn target_status(&self) -> ApprovalStatus {
        match self {
            ApprovalAction::Approve => ApprovalStatus::Approved,
            ApprovalAction::Reject => ApprovalStatus::Rejected,
        }
    }
}

impl FromStr for ApprovalAction {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ApprovalAction::Approve),
            "reject" => Ok(ApprovalAction::Reject),
            other => Err(RelayError::validation(format!(
                "Invalid action: {} (expected approve or reject)",
                other
            ))),
        }
    }
}

pub struct ApprovalWorkflow {
    store: Arc<dyn StoreAdapter>,
    queue: Arc<MessageQueue>,
    ledger: Arc<CommandEventLedger>,
}

impl ApprovalWorkflow {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        queue: Arc<MessageQueue>,
        ledger: Arc<CommandEventLedger>,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
        }
    }

    /// 扣留消息，创建 pending 审批
    pub async fn request_approval(
        &self,
        session_id: &str,
        message: &RelayMessage,
        policy: PolicySnapshot,
        requested_by: &str,
    ) -> RelayResult<CommandApprovalRequest> {
        let now = now_millis();
        let request = CommandApprovalRequest {
            approval_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            command_message: message.clone(),
            policy,
            status: ApprovalStatus::Pending,
            requested_by: requested_by.to_string(),
            resolved_by: None,
            reason: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        self.store.insert_approval(&request).await?;
        info!(
            "[ApprovalWorkflow] Approval {} requested by {} in {} (rule={})",
            request.approval_id, requested_by, session_id, request.policy.rule_id
        );
        Ok(request)
    }

    /// 处理审批
    ///
    /// 已是终态的请求返回 `AlreadyResolved`，不会重复入队或追加事件。
    pub async fn resolve(
        &self,
        session_id: &str,
        approval_id: &str,
        action: ApprovalAction,
        resolved_by: Option<String>,
        reason: Option<String>,
    ) -> RelayResult<CommandApprovalRequest> {
        let request = self
            .store
            .get_approval(approval_id)
            .await?
            .filter(|r| r.session_id == session_id)
            .ok_or(RelayError::ApprovalNotFound)?;

        if request.status.is_terminal() {
            return Err(RelayError::AlreadyResolved(request.status));
        }

        // 先确认会话还在，避免批准后消息无处可投
        let session = match action {
            ApprovalAction::Approve => Some(
                self.store
                    .get_session(session_id)
                    .await?
                    .ok_or(RelayError::SessionNotFound)?,
            ),
            ApprovalAction::Reject => None,
        };

        let resolution = ApprovalResolution {
            approval_id: approval_id.to_string(),
            status: action.target_status(),
            resolved_by,
            reason,
            resolved_at: now_millis(),
        };

        let Some(resolved) = self.store.resolve_approval(&resolution).await? else {
            let current = self
                .store
                .get_approval(approval_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(resolution.status);
            warn!(
                "[ApprovalWorkflow] Approval {} lost the resolve race (now {})",
                approval_id,
                current.as_str()
            );
            return Err(RelayError::AlreadyResolved(current));
        };

        if let Some(session) = &session {
            if let Err(e) = self.queue.enqueue(session, &resolved.command_message).await {
                error!(
                    "[ApprovalWorkflow] Approved command {} could not be queued: {}",
                    approval_id, e
                );
                // 已批准但投递失败，记一条 error 终态，避免时间线一直停在 pending
                let mut event = resolution_event(&resolved, action);
                event.result = EventResult {
                    status: ResultStatus::Error,
                    error_message: Some("approved command could not be queued".to_string()),
                    ..Default::default()
                };
                if let Err(record_err) = self.ledger.record(&event).await {
                    warn!(
                        "[ApprovalWorkflow] Failed to record delivery error for {}: {}",
                        approval_id, record_err
                    );
                }
                return Err(e);
            }
        }

        self.ledger
            .record(&resolution_event(&resolved, action))
            .await?;

        info!(
            "[ApprovalWorkflow] Approval {} {} by {}",
            approval_id,
            resolved.status.as_str(),
            resolved.resolved_by.as_deref().unwrap_or("unknown")
        );
        Ok(resolved)
    }

    /// 待处理的审批，新的在前
    pub async fn list_pending(
        &self,
        session_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<CommandApprovalRequest>> {
        Ok(self
            .store
            .list_approvals(session_id, Some(ApprovalStatus::Pending), limit)
            .await?)
    }

    /// 全部审批记录（时间线回填用）
    pub async fn list_all(
        &self,
        session_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<CommandApprovalRequest>> {
        Ok(self.store.list_approvals(session_id, None, limit).await?)
    }
}

/// 审批决议对应的审计事件
fn resolution_event(request: &CommandApprovalRequest, action: ApprovalAction) -> CommandEvent {
    let message = &request.command_message;

    let mut metadata = Map::new();
    metadata.insert("approval_id".to_string(), json!(request.approval_id));
    metadata.insert("command_id".to_string(), json!(command_id_for(message)));
    metadata.insert("action".to_string(), json!(action.as_str()));
    metadata.insert("requested_by".to_string(), json!(request.requested_by));
    if let Some(resolved_by) = &request.resolved_by {
        metadata.insert("resolved_by".to_string(), json!(resolved_by));
    }

    let result_status = match action {
        ApprovalAction::Approve => ResultStatus::Pending,
        ApprovalAction::Reject => ResultStatus::Cancelled,
    };

    CommandEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        session_id: request.session_id.clone(),
        timestamp: request.resolved_at.unwrap_or_else(now_millis),
        tool: EventTool {
            source: "relay".to_string(),
            name: Some("approval".to_string()),
        },
        command: EventCommand {
            raw: command_raw_for(message).unwrap_or_default().to_string(),
        },
        risk: EventRisk {
            level: request.policy.risk_level,
            reasons: request.policy.reasons.clone(),
        },
        policy: EventPolicy {
            decision: request.policy.decision,
            rule_id: request.policy.rule_id.clone(),
        },
        approval: EventApproval {
            required: true,
            status: Some(request.status),
            approved_by: request.resolved_by.clone(),
            approved_at: request.resolved_at,
            reason: request.reason.clone(),
        },
        result: EventResult {
            status: result_status,
            ..Default::default()
        },
        metadata,
    }
}
