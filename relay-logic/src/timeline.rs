//! 命令时间线汇总
//!
//! 把投影后的事件按链归并，每条链一行。

use crate::ledger::{derive_chain_keys, group_chains, ChainKind, CommandIdSource};
use relay_store::{
    ApprovalStatus, CommandApprovalRequest, CommandEvent, PolicyDecision, ResultStatus, RiskLevel,
};
use serde::Serialize;
use std::collections::HashMap;

/// 时间线中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineRow {
    pub chain_id: String,
    pub chain_kind: ChainKind,
    pub command_id: Option<String>,
    pub command_id_source: CommandIdSource,
    pub command_raw: Option<String>,
    pub requested_by: Option<String>,
    pub resolved_by: Option<String>,
    pub risk_level: RiskLevel,
    pub policy_decision: PolicyDecision,
    pub approval_status: Option<ApprovalStatus>,
    pub result_status: ResultStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub latest_timestamp: i64,
    pub event_count: usize,
}

/// 汇总，新的在前，最多 limit 行
///
/// 事件流里缺失 requested_by / resolved_by 时，从审批记录回填。
pub fn summarize(
    events: &[CommandEvent],
    approvals: &[CommandApprovalRequest],
    limit: usize,
) -> Vec<TimelineRow> {
    let keys = derive_chain_keys(events);
    let approvals: HashMap<&str, &CommandApprovalRequest> = approvals
        .iter()
        .map(|a| (a.approval_id.as_str(), a))
        .collect();

    let mut rows: Vec<TimelineRow> = group_chains(events, &keys)
        .into_iter()
        .filter_map(|members| {
            let first = *members.first()?;
            let latest = *members.last()?;
            let key = &keys[first];
            // members 按时间先后，倒序即新的在前
            let newest_first = || members.iter().rev().map(move |&i| &events[i]);

            let command_raw = newest_first()
                .map(|e| e.command.raw.trim())
                .find(|raw| !raw.is_empty())
                .map(str::to_string);

            let command_id = members
                .iter()
                .map(|&i| &keys[i])
                .find(|k| k.command_id.is_some())
                .map(|k| (k.command_id.clone(), k.command_id_source))
                .unwrap_or((None, CommandIdSource::None));

            let requested_by = newest_first()
                .find_map(|e| e.metadata_str("requested_by").or_else(|| e.metadata_str("sender_device_id")))
                .map(str::to_string);
            let resolved_by = newest_first()
                .find_map(|e| {
                    e.metadata_str("resolved_by")
                        .or(e.approval.approved_by.as_deref())
                })
                .map(str::to_string);

            // 风险取链上最高；决定取该事件（同级取最新）
            let riskiest = newest_first()
                .reduce(|best, e| if e.risk.level > best.risk.level { e } else { best })?;

            let approval_status = newest_first().find_map(|e| e.approval.status);

            let result = newest_first()
                .map(|e| &e.result)
                .find(|r| r.status.is_terminal())
                .unwrap_or(&events[latest].result);

            let mut row = TimelineRow {
                chain_id: key.id.clone(),
                chain_kind: key.kind,
                command_id: command_id.0,
                command_id_source: command_id.1,
                command_raw,
                requested_by,
                resolved_by,
                risk_level: riskiest.risk.level,
                policy_decision: riskiest.policy.decision,
                approval_status,
                result_status: result.status,
                exit_code: result.exit_code,
                duration_ms: result.duration_ms,
                error_message: result.error_message.clone(),
                latest_timestamp: events[latest].timestamp,
                event_count: members.len(),
            };

            if key.kind == ChainKind::Approval {
                if let Some(approval) = approvals.get(key.id.as_str()) {
                    backfill(&mut row, approval);
                }
            }
            Some(row)
        })
        .collect();

    rows.sort_by(|a, b| b.latest_timestamp.cmp(&a.latest_timestamp));
    rows.truncate(limit);
    rows
}

fn backfill(row: &mut TimelineRow, approval: &CommandApprovalRequest) {
    if row.requested_by.is_none() {
        row.requested_by = Some(approval.requested_by.clone());
    }
    if row.resolved_by.is_none() {
        row.resolved_by = approval.resolved_by.clone();
    }
    let stream_terminal = row.approval_status.map(|s| s.is_terminal()).unwrap_or(false);
    if !stream_terminal {
        row.approval_status = Some(approval.status);
    }
}
