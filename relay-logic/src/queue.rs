//! 消息队列
//!
//! mobile→PC 只有一个队列；PC→mobile 按已加入的 mobile 扇出，另写一份 broadcast
//! 给没有固定 id 的 mobile。出队是破坏性的，每条消息最多交付一次。

use crate::config::RelayConfig;
use crate::error::RelayResult;
use relay_store::{now_millis, DeviceType, QueueTarget, RelayMessage, Session, StoreAdapter};
use std::sync::Arc;
use tracing::debug;

/// 读取方对应的队列
pub fn target_for(device_type: DeviceType, device_id: Option<&str>) -> QueueTarget {
    match device_type {
        DeviceType::Pc => QueueTarget::Pc,
        DeviceType::Mobile => match device_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => QueueTarget::Mobile(id.to_string()),
            None => QueueTarget::MobileBroadcast,
        },
    }
}

pub struct MessageQueue {
    store: Arc<dyn StoreAdapter>,
    config: Arc<RelayConfig>,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn StoreAdapter>, config: Arc<RelayConfig>) -> Self {
        Self { store, config }
    }

    /// 入队，返回写入的队列数
    pub async fn enqueue(&self, session: &Session, message: &RelayMessage) -> RelayResult<usize> {
        let expires_at = now_millis() + self.config.message_ttl_ms();

        let targets: Vec<QueueTarget> = match message.to {
            DeviceType::Pc => vec![QueueTarget::Pc],
            DeviceType::Mobile => session
                .mobile_device_ids
                .iter()
                .map(|id| QueueTarget::Mobile(id.clone()))
                .chain(std::iter::once(QueueTarget::MobileBroadcast))
                .collect(),
        };

        for target in &targets {
            self.store
                .push_message(&session.session_id, target, message, expires_at)
                .await?;
        }

        debug!(
            "[MessageQueue] {} {} -> {} queued to {} target(s) in {}",
            message.message_type,
            message.from,
            message.to,
            targets.len(),
            session.session_id
        );
        Ok(targets.len())
    }

    /// 按先进先出弹出，数量被限制在 [1, poll_max_batch]
    pub async fn dequeue(
        &self,
        session_id: &str,
        device_type: DeviceType,
        limit: Option<usize>,
        device_id: Option<&str>,
    ) -> RelayResult<Vec<RelayMessage>> {
        let limit = self.config.clamp_batch(limit);
        let target = target_for(device_type, device_id);
        let messages = self.store.pop_messages(session_id, &target, limit).await?;

        if !messages.is_empty() {
            debug!(
                "[MessageQueue] Dequeued {} message(s) from {}:{}",
                messages.len(),
                session_id,
                target.key_suffix()
            );
        }
        Ok(messages)
    }

    /// 不消费地检查是否有待取消息
    pub async fn has_pending(
        &self,
        session_id: &str,
        device_type: DeviceType,
        device_id: Option<&str>,
    ) -> RelayResult<bool> {
        let target = target_for(device_type, device_id);
        Ok(self.store.has_messages(session_id, &target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::SqliteStore;
    use serde_json::json;

    async fn setup(mobiles: &[&str]) -> (MessageQueue, Session) {
        let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::in_memory().unwrap());
        let now = now_millis();
        let session = Session::new("ABC234".to_string(), now, now + 60_000);
        store.create_session(&session).await.unwrap();
        for id in mobiles {
            store.add_mobile("ABC234", id, now + 60_000).await.unwrap();
        }
        let session = store.get_session("ABC234").await.unwrap().unwrap();
        let queue = MessageQueue::new(store, Arc::new(RelayConfig::default()));
        (queue, session)
    }

    fn message(id: &str, from: DeviceType) -> RelayMessage {
        RelayMessage {
            id: id.to_string(),
            message_type: "insert_text".to_string(),
            from,
            to: from.opposite(),
            data: json!({ "text": id }),
            timestamp: now_millis(),
        }
    }

    #[test]
    fn test_target_for() {
        assert_eq!(target_for(DeviceType::Pc, Some("P1")), QueueTarget::Pc);
        assert_eq!(
            target_for(DeviceType::Mobile, Some("M1")),
            QueueTarget::Mobile("M1".to_string())
        );
        assert_eq!(target_for(DeviceType::Mobile, None), QueueTarget::MobileBroadcast);
        assert_eq!(target_for(DeviceType::Mobile, Some(" ")), QueueTarget::MobileBroadcast);
    }

    #[tokio::test]
    async fn test_fan_out_to_mobiles() {
        let (queue, session) = setup(&["M1", "M2"]).await;
        let written = queue
            .enqueue(&session, &message("out", DeviceType::Pc))
            .await
            .unwrap();
        assert_eq!(written, 3);

        for device in [Some("M1"), Some("M2"), None] {
            let got = queue
                .dequeue("ABC234", DeviceType::Mobile, None, device)
                .await
                .unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].id, "out");
        }
    }

    #[tokio::test]
    async fn test_device_named_broadcast_gets_one_copy() {
        let (queue, session) = setup(&["broadcast"]).await;
        queue
            .enqueue(&session, &message("out", DeviceType::Pc))
            .await
            .unwrap();

        let named = queue
            .dequeue("ABC234", DeviceType::Mobile, None, Some("broadcast"))
            .await
            .unwrap();
        assert_eq!(named.len(), 1);

        // 匿名 mobile 的队列不受影响
        let anonymous = queue
            .dequeue("ABC234", DeviceType::Mobile, None, None)
            .await
            .unwrap();
        assert_eq!(anonymous.len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_dequeue() {
        let (queue, session) = setup(&[]).await;
        for i in 0..60 {
            queue
                .enqueue(&session, &message(&format!("m{}", i), DeviceType::Mobile))
                .await
                .unwrap();
        }

        let first = queue
            .dequeue("ABC234", DeviceType::Pc, Some(1000), None)
            .await
            .unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(first[0].id, "m0");

        assert!(queue.has_pending("ABC234", DeviceType::Pc, None).await.unwrap());
        let rest = queue
            .dequeue("ABC234", DeviceType::Pc, Some(1000), None)
            .await
            .unwrap();
        assert_eq!(rest.len(), 10);
        assert!(!queue.has_pending("ABC234", DeviceType::Pc, None).await.unwrap());
    }
}
