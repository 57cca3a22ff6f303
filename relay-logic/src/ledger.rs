//! 命令事件账本
//!
//! 事件只追加、不修改。读取时按链（同一条逻辑命令的全部事件）做投影：
//! 叠加链上最新的审批子状态，并把已知的终态结果补到仍显示 pending 的可执行记录上。
//! 投影只会把 pending 替换成终态，不会反过来。

use crate::config::RelayConfig;
use crate::error::RelayResult;
use relay_store::{
    now_millis, CommandEvent, EventApproval, EventCommand, EventPolicy, EventResult, EventRisk,
    EventTool, RelayMessage, ResultStatus, StoreAdapter,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// 命令 id：data.command_id / data.commandId，缺省用消息 id
pub fn command_id_for(message: &RelayMessage) -> String {
    message
        .data_str("command_id")
        .or_else(|| message.data_str("commandId"))
        .filter(|id| !id.is_empty())
        .unwrap_or(&message.id)
        .to_string()
}

/// 命令原文：data.command，其次 data.commandRaw
pub fn command_raw_for(message: &RelayMessage) -> Option<&str> {
    message
        .data_str("command")
        .or_else(|| message.data_str("commandRaw"))
        .filter(|raw| !raw.trim().is_empty())
}

/// 外部追加的事件（event_id / timestamp 可省略，由服务端补齐）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewCommandEvent {
    pub event_id: Option<String>,
    pub timestamp: Option<i64>,
    pub tool: EventTool,
    pub command: EventCommand,
    pub risk: EventRisk,
    pub policy: EventPolicy,
    pub approval: EventApproval,
    pub result: EventResult,
    pub metadata: Map<String, Value>,
}

impl NewCommandEvent {
    pub fn into_event(self, session_id: &str) -> CommandEvent {
        CommandEvent {
            event_id: self
                .event_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            session_id: session_id.to_string(),
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            tool: self.tool,
            command: self.command,
            risk: self.risk,
            policy: self.policy,
            approval: self.approval,
            result: self.result,
            metadata: self.metadata,
        }
    }
}

// ==================== 链 ====================

/// 链类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Approval,
    Command,
    Event,
}

/// command_id 的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandIdSource {
    Direct,
    Inferred,
    None,
}

/// 单个事件归属的链
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainKey {
    pub kind: ChainKind,
    pub id: String,
    pub command_id: Option<String>,
    pub command_id_source: CommandIdSource,
}

impl ChainKey {
    /// 分组用的键（kind + id）
    pub fn group_key(&self) -> (ChainKind, &str) {
        (self.kind, self.id.as_str())
    }
}

/// 为每个事件推导链归属，顺序与输入一致
///
/// - 有 approval_id → 审批链
/// - 有 command_id（直接或推断）→ 若该 command_id 被某些事件唯一关联到一个 approval_id，
///   并入那条审批链；否则是命令链
/// - 否则是只包含自己的事件链
///
/// 推断：事件没有 command_id 时，若同样 command.raw 的其他事件里只出现过一个
/// command_id，就用它。
pub fn derive_chain_keys(events: &[CommandEvent]) -> Vec<ChainKey> {
    let mut approvals_by_command: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    let mut commands_by_raw: HashMap<&str, BTreeSet<&str>> = HashMap::new();

    for event in events {
        if let Some(command_id) = event.command_id() {
            if let Some(approval_id) = event.approval_id() {
                approvals_by_command
                    .entry(command_id)
                    .or_default()
                    .insert(approval_id);
            }
            let raw = event.command.raw.trim();
            if !raw.is_empty() {
                commands_by_raw.entry(raw).or_default().insert(command_id);
            }
        }
    }

    events
        .iter()
        .map(|event| {
            let (command_id, source) = match event.command_id() {
                Some(id) => (Some(id), CommandIdSource::Direct),
                None => {
                    let raw = event.command.raw.trim();
                    let inferred = commands_by_raw
                        .get(raw)
                        .filter(|ids| !raw.is_empty() && ids.len() == 1)
                        .and_then(|ids| ids.iter().next().copied());
                    match inferred {
                        Some(id) => (Some(id), CommandIdSource::Inferred),
                        None => (None, CommandIdSource::None),
                    }
                }
            };

            let linked_approval = command_id
                .and_then(|id| approvals_by_command.get(id))
                .filter(|ids| ids.len() == 1)
                .and_then(|ids| ids.iter().next().copied());

            let (kind, id) = match (event.approval_id(), linked_approval, command_id) {
                (Some(approval_id), _, _) => (ChainKind::Approval, approval_id),
                (None, Some(approval_id), _) => (ChainKind::Approval, approval_id),
                (None, None, Some(command_id)) => (ChainKind::Command, command_id),
                (None, None, None) => (ChainKind::Event, event.event_id.as_str()),
            };

            ChainKey {
                kind,
                id: id.to_string(),
                command_id: command_id.map(str::to_string),
                command_id_source: source,
            }
        })
        .collect()
}

/// 按链分组，返回每条链的事件下标（按时间先后）
pub(crate) fn group_chains(events: &[CommandEvent], keys: &[ChainKey]) -> Vec<Vec<usize>> {
    let mut order: Vec<(ChainKind, &str)> = Vec::new();
    let mut groups: HashMap<(ChainKind, &str), Vec<usize>> = HashMap::new();

    for (index, key) in keys.iter().enumerate() {
        let group_key = key.group_key();
        let members = groups.entry(group_key).or_insert_with(|| {
            order.push(group_key);
            Vec::new()
        });
        members.push(index);
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|mut members| {
            // 时间相同的，输入里靠后（更旧）的排前面
            members.sort_by(|&a, &b| {
                events[a]
                    .timestamp
                    .cmp(&events[b].timestamp)
                    .then_with(|| b.cmp(&a))
            });
            members
        })
        .collect()
}

/// 该事件是否代表需要执行的那条记录
pub fn is_actionable(event: &CommandEvent) -> bool {
    event.metadata_str("message_type") == Some("execute_command")
        || event.metadata_str("action") == Some("approve")
}

/// 读时投影，输出顺序与输入一致
pub fn project_final_status(events: &[CommandEvent]) -> Vec<CommandEvent> {
    let keys = derive_chain_keys(events);
    let mut projected = events.to_vec();

    for members in group_chains(events, &keys) {
        // a. 最新的审批子状态，终态优先（max_by_key 取最后一个最大值）
        let approval = members
            .iter()
            .map(|&i| &events[i].approval)
            .filter(|a| a.status.is_some())
            .max_by_key(|a| a.status.map(|s| s.is_terminal()).unwrap_or(false))
            .cloned();
        let approval_required = members.iter().any(|&i| events[i].approval.required);

        // b. 最新的终态结果
        let terminal = members
            .iter()
            .rev()
            .map(|&i| &events[i].result)
            .find(|r| r.status.is_terminal())
            .cloned();

        for &i in &members {
            let event = &mut projected[i];

            if let Some(latest) = &approval {
                let current_terminal = event.approval.status.map(|s| s.is_terminal()).unwrap_or(false);
                let latest_terminal = latest.status.map(|s| s.is_terminal()).unwrap_or(false);
                if latest_terminal || !current_terminal {
                    event.approval = EventApproval {
                        required: approval_required,
                        ..latest.clone()
                    };
                }
            }

            if let Some(result) = &terminal {
                if event.result.status == ResultStatus::Pending && is_actionable(&events[i]) {
                    event.result = result.clone();
                }
            }
        }
    }

    projected
}

// ==================== 账本 ====================

pub struct CommandEventLedger {
    store: Arc<dyn StoreAdapter>,
    config: Arc<RelayConfig>,
}

impl CommandEventLedger {
    pub fn new(store: Arc<dyn StoreAdapter>, config: Arc<RelayConfig>) -> Self {
        Self { store, config }
    }

    /// 追加外部上报的事件
    pub async fn append(&self, session_id: &str, input: NewCommandEvent) -> RelayResult<CommandEvent> {
        let event = input.into_event(session_id);
        self.record(&event).await?;
        Ok(event)
    }

    /// 追加服务端生成的事件
    pub async fn record(&self, event: &CommandEvent) -> RelayResult<()> {
        self.store.append_event(event).await?;
        debug!(
            "[CommandEventLedger] {} appended to {} (result={:?})",
            event.event_id, event.session_id, event.result.status
        );
        Ok(())
    }

    /// 原始事件，新的在前
    pub async fn list(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> RelayResult<Vec<CommandEvent>> {
        Ok(self.store.list_events(session_id, limit, approval_id).await?)
    }

    /// 会话的投影历史（新的在前，受历史上限约束）
    pub async fn projected_history(&self, session_id: &str) -> RelayResult<Vec<CommandEvent>> {
        let history = self
            .store
            .list_events(session_id, self.config.event_history_limit, None)
            .await?;
        Ok(project_final_status(&history))
    }

    /// 投影后的事件，新的在前
    ///
    /// 先在完整历史上投影再过滤、截断，被 limit 截掉的链仍能对上终态。
    pub async fn list_projected(
        &self,
        session_id: &str,
        limit: usize,
        approval_id: Option<&str>,
    ) -> RelayResult<Vec<CommandEvent>> {
        let projected = self.projected_history(session_id).await?;

        let events = match approval_id {
            Some(approval_id) => {
                let keys = derive_chain_keys(&projected);
                projected
                    .into_iter()
                    .zip(keys)
                    .filter(|(_, key)| key.kind == ChainKind::Approval && key.id == approval_id)
                    .map(|(event, _)| event)
                    .take(limit)
                    .collect()
            }
            None => projected.into_iter().take(limit).collect(),
        };
        Ok(events)
    }
}
