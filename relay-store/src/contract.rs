//! 两个后端共用的行为测试
//!
//! 每个用例只依赖 `StoreAdapter`，由 sqlite / redis 的测试模块各自调用一遍。

use crate::adapter::StoreAdapter;
use crate::types::{
    now_millis, ApprovalResolution, ApprovalStatus, CommandApprovalRequest, CommandEvent,
    DeviceType, EventApproval, EventCommand, EventPolicy, EventResult, EventRisk, EventTool,
    PolicyDecision, PolicySnapshot, QueueTarget, RelayMessage, ResultStatus, RiskLevel, Session,
};
use serde_json::json;

pub const HOUR_MS: i64 = 60 * 60 * 1000;

pub async fn with_session(store: &dyn StoreAdapter, id: &str) {
    let now = now_millis();
    let created = store
        .create_session(&Session::new(id.to_string(), now, now + HOUR_MS))
        .await
        .unwrap();
    assert!(created);
}

pub fn message(id: &str, from: DeviceType) -> RelayMessage {
    RelayMessage {
        id: id.to_string(),
        message_type: "insert_text".to_string(),
        from,
        to: from.opposite(),
        data: json!({ "text": id }),
        timestamp: now_millis(),
    }
}

pub fn approval(id: &str, session_id: &str, created_at: i64) -> CommandApprovalRequest {
    CommandApprovalRequest {
        approval_id: id.to_string(),
        session_id: session_id.to_string(),
        command_message: message("m-approval", DeviceType::Mobile),
        policy: PolicySnapshot {
            risk_level: RiskLevel::High,
            reasons: vec!["privilege escalation".to_string()],
            decision: PolicyDecision::ApprovalRequired,
            rule_id: "high.sudo".to_string(),
        },
        status: ApprovalStatus::Pending,
        requested_by: "M1".to_string(),
        resolved_by: None,
        reason: None,
        created_at,
        updated_at: created_at,
        resolved_at: None,
    }
}

pub fn approve(id: &str) -> ApprovalResolution {
    ApprovalResolution {
        approval_id: id.to_string(),
        status: ApprovalStatus::Approved,
        resolved_by: Some("M1".to_string()),
        reason: None,
        resolved_at: now_millis(),
    }
}

fn event(id: &str, session_id: &str, timestamp: i64, approval_id: Option<&str>) -> CommandEvent {
    let mut metadata = serde_json::Map::new();
    if let Some(approval_id) = approval_id {
        metadata.insert("approval_id".to_string(), json!(approval_id));
    }
    CommandEvent {
        event_id: id.to_string(),
        session_id: session_id.to_string(),
        timestamp,
        tool: EventTool::default(),
        command: EventCommand { raw: "ls".to_string() },
        risk: EventRisk::default(),
        policy: EventPolicy::default(),
        approval: EventApproval::default(),
        result: EventResult {
            status: ResultStatus::Pending,
            ..Default::default()
        },
        metadata,
    }
}

pub async fn create_session_is_create_if_absent(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    let now = now_millis();
    let again = store
        .create_session(&Session::new("ABC234".to_string(), now, now + HOUR_MS))
        .await
        .unwrap();
    assert!(!again);
    assert_eq!(store.list_sessions().await.unwrap().len(), 1);
}

pub async fn expired_session_is_invisible_and_replaceable(store: &dyn StoreAdapter) {
    let now = now_millis();
    store
        .create_session(&Session::new("OLD234".to_string(), now - 2 * HOUR_MS, now - HOUR_MS))
        .await
        .unwrap();

    assert!(store.get_session("OLD234").await.unwrap().is_none());
    let recreated = store
        .create_session(&Session::new("OLD234".to_string(), now, now + HOUR_MS))
        .await
        .unwrap();
    assert!(recreated);
    assert!(store.get_session("OLD234").await.unwrap().is_some());
}

pub async fn membership_updates(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    let now = now_millis();

    assert!(store.add_mobile("ABC234", "M1", now + HOUR_MS).await.unwrap());
    assert!(store.add_mobile("ABC234", "M1", now + HOUR_MS).await.unwrap());
    assert!(store.set_pc("ABC234", "P1", Some("hash"), now, now + HOUR_MS).await.unwrap());
    assert!(!store.add_mobile("NOPE22", "M1", now + HOUR_MS).await.unwrap());

    let session = store.get_session("ABC234").await.unwrap().unwrap();
    assert_eq!(session.mobile_device_ids.len(), 1);
    assert_eq!(session.pc_device_id.as_deref(), Some("P1"));
    assert_eq!(session.pc_pin_hash.as_deref(), Some("hash"));

    assert!(!store.touch_pc("ABC234", "P2", now + 5).await.unwrap());
    assert!(store.touch_pc("ABC234", "P1", now + 5).await.unwrap());
    assert!(!store.clear_pc("ABC234", "P2").await.unwrap());
    assert!(store.clear_pc("ABC234", "P1").await.unwrap());
    assert!(store.remove_mobile("ABC234", "M1").await.unwrap());

    let session = store.get_session("ABC234").await.unwrap().unwrap();
    assert!(session.pc_device_id.is_none());
    assert!(session.pc_pin_hash.is_none());
    assert!(session.mobile_device_ids.is_empty());
}

pub async fn queue_is_fifo_and_destructive(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    let expires = now_millis() + 60_000;
    for id in ["m1", "m2", "m3"] {
        store
            .push_message("ABC234", &QueueTarget::Pc, &message(id, DeviceType::Mobile), expires)
            .await
            .unwrap();
    }

    assert!(store.has_messages("ABC234", &QueueTarget::Pc).await.unwrap());
    let first = store.pop_messages("ABC234", &QueueTarget::Pc, 2).await.unwrap();
    assert_eq!(
        first.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2"]
    );
    let rest = store.pop_messages("ABC234", &QueueTarget::Pc, 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, "m3");
    assert!(!store.has_messages("ABC234", &QueueTarget::Pc).await.unwrap());
}

pub async fn queues_are_isolated_per_target(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    let expires = now_millis() + 60_000;
    let named = QueueTarget::Mobile("broadcast".to_string());
    store
        .push_message("ABC234", &named, &message("one", DeviceType::Pc), expires)
        .await
        .unwrap();

    assert!(!store
        .has_messages("ABC234", &QueueTarget::MobileBroadcast)
        .await
        .unwrap());
    assert_eq!(store.pop_messages("ABC234", &named, 10).await.unwrap().len(), 1);
}

pub async fn expired_messages_are_dropped(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    let target = QueueTarget::Mobile("M1".to_string());
    store
        .push_message("ABC234", &target, &message("old", DeviceType::Pc), now_millis() - 1)
        .await
        .unwrap();

    assert!(!store.has_messages("ABC234", &target).await.unwrap());
    assert!(store.pop_messages("ABC234", &target, 10).await.unwrap().is_empty());
}

pub async fn resolve_approval_only_once(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    store.insert_approval(&approval("a1", "ABC234", now_millis())).await.unwrap();

    let first = store.resolve_approval(&approve("a1")).await.unwrap().unwrap();
    assert_eq!(first.status, ApprovalStatus::Approved);

    let reject = ApprovalResolution {
        status: ApprovalStatus::Rejected,
        ..approve("a1")
    };
    assert!(store.resolve_approval(&reject).await.unwrap().is_none());
    assert!(store.resolve_approval(&approve("missing")).await.unwrap().is_none());

    let stored = store.get_approval("a1").await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);
    assert_eq!(stored.resolved_by.as_deref(), Some("M1"));
}

pub async fn list_approvals_filters_and_orders(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    let now = now_millis();
    store.insert_approval(&approval("a1", "ABC234", now - 10)).await.unwrap();
    store.insert_approval(&approval("a2", "ABC234", now)).await.unwrap();
    store.insert_approval(&approval("b1", "XYZ789", now)).await.unwrap();

    let pending = store
        .list_approvals("ABC234", Some(ApprovalStatus::Pending), 10)
        .await
        .unwrap();
    assert_eq!(
        pending.iter().map(|a| a.approval_id.as_str()).collect::<Vec<_>>(),
        vec!["a2", "a1"]
    );
    let limited = store.list_approvals("ABC234", None, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

pub async fn list_events_newest_first_with_filter(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    store.append_event(&event("e1", "ABC234", 100, Some("a1"))).await.unwrap();
    store.append_event(&event("e2", "ABC234", 300, None)).await.unwrap();
    store.append_event(&event("e3", "ABC234", 200, Some("a1"))).await.unwrap();

    let all = store.list_events("ABC234", 10, None).await.unwrap();
    assert_eq!(
        all.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
        vec!["e2", "e3", "e1"]
    );
    let filtered = store.list_events("ABC234", 10, Some("a1")).await.unwrap();
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|e| e.approval_id() == Some("a1")));
}

pub async fn device_binding(store: &dyn StoreAdapter) {
    with_session(store, "ABC234").await;
    store.bind_device("M1", "ABC234", now_millis() + HOUR_MS).await.unwrap();
    assert_eq!(store.device_session("M1").await.unwrap().as_deref(), Some("ABC234"));
    assert!(store.device_session("M2").await.unwrap().is_none());
}
