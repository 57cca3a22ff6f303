//! 领域类型定义
//!
//! Session / RelayMessage / 审批请求 / 命令事件，两种存储后端共享同一套类型。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 设备角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Pc,
    Mobile,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Pc => "pc",
            DeviceType::Mobile => "mobile",
        }
    }

    /// 消息的接收方角色
    pub fn opposite(&self) -> DeviceType {
        match self {
            DeviceType::Pc => DeviceType::Mobile,
            DeviceType::Mobile => DeviceType::Pc,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pc" => Ok(DeviceType::Pc),
            "mobile" => Ok(DeviceType::Mobile),
            other => Err(format!("Invalid deviceType: {}", other)),
        }
    }
}

/// 会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc_last_seen_at: Option<i64>,
    /// PIN 哈希只在存储层流转，不会序列化给调用方
    #[serde(default, skip_serializing)]
    pub pc_pin_hash: Option<String>,
    #[serde(default)]
    pub mobile_device_ids: BTreeSet<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn new(session_id: String, created_at: i64, expires_at: i64) -> Self {
        Self {
            session_id,
            pc_device_id: None,
            pc_last_seen_at: None,
            pc_pin_hash: None,
            mobile_device_ids: BTreeSet::new(),
            created_at,
            expires_at,
        }
    }

    pub fn has_mobile(&self) -> bool {
        !self.mobile_device_ids.is_empty()
    }

    pub fn has_pin(&self) -> bool {
        self.pc_pin_hash.is_some()
    }

    /// PC 是否在线（last seen 未超过阈值）
    pub fn pc_is_fresh(&self, now: i64, stale_after_ms: i64) -> bool {
        match (&self.pc_device_id, self.pc_last_seen_at) {
            (Some(_), Some(seen)) => now - seen <= stale_after_ms,
            _ => false,
        }
    }
}

/// 中继消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: DeviceType,
    pub to: DeviceType,
    #[serde(default = "empty_object")]
    pub data: Value,
    pub timestamp: i64,
}

impl RelayMessage {
    /// 读取 data 中的字符串字段
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// 队列目标
///
/// PC→mobile 的消息按 mobile 设备扇出，另有一个 broadcast 队列给没有固定 id 的 mobile。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueTarget {
    Pc,
    Mobile(String),
    MobileBroadcast,
}

impl QueueTarget {
    /// 队列 key 后缀；broadcast 不带 `mobile:` 前缀，任何设备 id 都拼不出它
    pub fn key_suffix(&self) -> String {
        match self {
            QueueTarget::Pc => "pc".to_string(),
            QueueTarget::Mobile(device_id) => format!("mobile:{}", device_id),
            QueueTarget::MobileBroadcast => "broadcast".to_string(),
        }
    }
}

/// 带过期时间的队列记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message: RelayMessage,
    pub expires_at: i64,
}

// ==================== 策略 ====================

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// 策略决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    ApprovalRequired,
    Deny,
}

/// 策略评估结果快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub decision: PolicyDecision,
    pub rule_id: String,
}

// ==================== 审批 ====================

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("Unknown approval status: {}", other)),
        }
    }
}

/// 命令审批请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandApprovalRequest {
    pub approval_id: String,
    pub session_id: String,
    /// 被扣留的原始消息，审批通过后原样入队
    pub command_message: RelayMessage,
    pub policy: PolicySnapshot,
    pub status: ApprovalStatus,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

/// 审批决议（存储层的单次条件写入）
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub approval_id: String,
    pub status: ApprovalStatus,
    pub resolved_by: Option<String>,
    pub reason: Option<String>,
    pub resolved_at: i64,
}

impl CommandApprovalRequest {
    /// 应用决议，返回新的记录
    pub fn resolved(&self, resolution: &ApprovalResolution) -> Self {
        let mut next = self.clone();
        next.status = resolution.status;
        next.resolved_by = resolution.resolved_by.clone();
        next.reason = resolution.reason.clone();
        next.resolved_at = Some(resolution.resolved_at);
        next.updated_at = resolution.resolved_at;
        next
    }
}

// ==================== 命令事件 ====================

/// 命令执行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    #[default]
    Pending,
    Success,
    Error,
    Cancelled,
    Timeout,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventTool {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventCommand {
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRisk {
    pub level: RiskLevel,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl Default for EventRisk {
    fn default() -> Self {
        Self {
            level: RiskLevel::Low,
            reasons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPolicy {
    pub decision: PolicyDecision,
    #[serde(default)]
    pub rule_id: String,
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self {
            decision: PolicyDecision::Allow,
            rule_id: String::new(),
        }
    }
}

/// 事件中的审批子状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventApproval {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub status: Option<ApprovalStatus>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// 事件中的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventResult {
    #[serde(default)]
    pub status: ResultStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// 命令审计事件（只追加，不原地修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub event_id: String,
    pub session_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub tool: EventTool,
    #[serde(default)]
    pub command: EventCommand,
    #[serde(default)]
    pub risk: EventRisk,
    #[serde(default)]
    pub policy: EventPolicy,
    #[serde(default)]
    pub approval: EventApproval,
    #[serde(default)]
    pub result: EventResult,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CommandEvent {
    /// 读取 metadata 中的非空字符串
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn approval_id(&self) -> Option<&str> {
        self.metadata_str("approval_id")
    }

    pub fn command_id(&self) -> Option<&str> {
        self.metadata_str("command_id")
    }
}
