//! 会话管理
//!
//! 创建 / 加入 / 离开 / 心跳 / PIN 校验，以及给未连接 PC 用的会话发现。
//! PC 是否在线由 `pcLastSeenAt` 推断，断开时不会显式通知。

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use rand::Rng;
use relay_store::{now_millis, DeviceType, QueueTarget, Session, StoreAdapter};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 会话码字母表（去掉 0/O/1/I）
pub const SESSION_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// 会话码长度
pub const SESSION_ID_LEN: usize = 6;

/// 生成随机会话码
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

/// PIN 哈希：SHA-256(sessionId:pin)，十六进制
pub fn hash_pin(session_id: &str, pin: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", session_id, pin).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn verify_pin(
    session_id: &str,
    device_id: &str,
    pin: Option<&str>,
    expected: &str,
) -> RelayResult<()> {
    match pin {
        None => Err(RelayError::PinRequired),
        Some(pin) if hash_pin(session_id, pin) != expected => {
            warn!(
                "[SessionStore] Invalid PIN from {} for session {}",
                device_id, session_id
            );
            Err(RelayError::InvalidPin)
        }
        Some(_) => Ok(()),
    }
}

pub struct SessionStore {
    store: Arc<dyn StoreAdapter>,
    config: Arc<RelayConfig>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn StoreAdapter>, config: Arc<RelayConfig>) -> Self {
        Self { store, config }
    }

    /// 创建会话（不存在才写入，冲突时换码重试）
    pub async fn create(&self) -> RelayResult<Session> {
        let attempts = self.config.session_id_attempts.max(1);
        for attempt in 1..=attempts {
            let now = now_millis();
            let session = Session::new(
                generate_session_id(),
                now,
                now + self.config.session_ttl_ms(),
            );

            if self.store.create_session(&session).await? {
                info!("[SessionStore] Session created: {}", session.session_id);
                return Ok(session);
            }
            warn!(
                "[SessionStore] Session id collision on attempt {}/{}: {}",
                attempt, attempts, session.session_id
            );
        }
        Err(RelayError::SessionIdExhausted(attempts))
    }

    pub async fn get(&self, session_id: &str) -> RelayResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(RelayError::SessionNotFound)
    }

    /// 未显式给出 sessionId 时，按设备绑定反查
    pub async fn resolve_session_id(
        &self,
        session_id: Option<&str>,
        device_id: Option<&str>,
    ) -> RelayResult<String> {
        if let Some(session_id) = non_empty(session_id) {
            return Ok(session_id.to_string());
        }
        if let Some(device_id) = non_empty(device_id) {
            if let Some(bound) = self.store.device_session(device_id).await? {
                debug!("[SessionStore] Resolved {} -> {}", device_id, bound);
                return Ok(bound);
            }
        }
        Err(RelayError::validation("sessionId is required"))
    }

    /// 加入会话
    pub async fn join(
        &self,
        session_id: &str,
        device_id: &str,
        device_type: DeviceType,
        pin: Option<&str>,
    ) -> RelayResult<Session> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(RelayError::validation("deviceId is required"));
        }

        let session = self.get(session_id).await?;
        let now = now_millis();
        let expires_at = now + self.config.session_ttl_ms();
        let pin = non_empty(pin);

        let joined = match device_type {
            DeviceType::Pc => {
                let same_pc = session.pc_device_id.as_deref() == Some(device_id);
                if !same_pc {
                    // 换 PC：设了 PIN 就必须带对 PIN；没设 PIN 只能接管已超时的 PC
                    match session.pc_pin_hash.as_deref() {
                        Some(expected) => verify_pin(session_id, device_id, pin, expected)?,
                        None if session.pc_is_fresh(now, self.config.pc_stale_after_ms()) => {
                            warn!(
                                "[SessionStore] Rejected PC {} for session {}: current PC is active",
                                device_id, session_id
                            );
                            return Err(RelayError::forbidden(
                                "Session already has an active PC",
                            ));
                        }
                        None => {}
                    }
                    if let Some(current) = session.pc_device_id.as_deref() {
                        warn!(
                            "[SessionStore] Session {} PC replaced: {} -> {}",
                            session_id, current, device_id
                        );
                    }
                }

                // 同一台 PC 重连且未带 PIN 时沿用原 PIN
                let pin_hash = match pin {
                    Some(pin) => Some(hash_pin(session_id, pin)),
                    None if same_pc => session.pc_pin_hash.clone(),
                    None => None,
                };

                self.store
                    .set_pc(session_id, device_id, pin_hash.as_deref(), now, expires_at)
                    .await?
            }
            DeviceType::Mobile => {
                if let Some(expected) = session.pc_pin_hash.as_deref() {
                    verify_pin(session_id, device_id, pin, expected)?;
                }

                self.store
                    .add_mobile(session_id, device_id, expires_at)
                    .await?
            }
        };

        if !joined {
            return Err(RelayError::SessionNotFound);
        }

        self.store
            .bind_device(device_id, session_id, expires_at)
            .await?;
        info!(
            "[SessionStore] {} {} joined session {}",
            device_type, device_id, session_id
        );

        self.get(session_id).await
    }

    /// 离开会话；mobile 离开时清掉发给它的队列
    pub async fn leave(
        &self,
        session_id: &str,
        device_id: &str,
        device_type: DeviceType,
    ) -> RelayResult<Session> {
        self.get(session_id).await?;

        match device_type {
            DeviceType::Pc => {
                if !self.store.clear_pc(session_id, device_id).await? {
                    debug!(
                        "[SessionStore] {} is not the PC of session {}, nothing to clear",
                        device_id, session_id
                    );
                }
            }
            DeviceType::Mobile => {
                self.store.remove_mobile(session_id, device_id).await?;
                let purged = self
                    .store
                    .clear_queue(session_id, &QueueTarget::Mobile(device_id.to_string()))
                    .await?;
                if purged > 0 {
                    debug!(
                        "[SessionStore] Purged {} queued messages for {}",
                        purged, device_id
                    );
                }
            }
        }

        info!(
            "[SessionStore] {} {} left session {}",
            device_type, device_id, session_id
        );
        self.get(session_id).await
    }

    /// PC 心跳
    pub async fn heartbeat(&self, session_id: &str, device_id: &str) -> RelayResult<Session> {
        let session = self.get(session_id).await?;
        if session.pc_device_id.as_deref() != Some(device_id) {
            return Err(RelayError::forbidden(
                "Device is not the registered PC for this session",
            ));
        }

        if !self.store.touch_pc(session_id, device_id, now_millis()).await? {
            return Err(RelayError::SessionNotFound);
        }
        self.get(session_id).await
    }

    /// 仅当 device_id 是当前 PC 时刷新在线时间，返回是否刷新
    pub async fn touch_if_pc(&self, session: &Session, device_id: &str) -> RelayResult<bool> {
        if session.pc_device_id.as_deref() != Some(device_id) {
            return Ok(false);
        }
        Ok(self
            .store
            .touch_pc(&session.session_id, device_id, now_millis())
            .await?)
    }

    pub async fn delete(&self, session_id: &str) -> RelayResult<()> {
        if !self.store.delete_session(session_id).await? {
            return Err(RelayError::SessionNotFound);
        }
        info!("[SessionStore] Session deleted: {}", session_id);
        Ok(())
    }

    /// 等待 PC 的会话：没有 PC，或 PC 已超时。有 mobile 的排前面，其次按创建时间倒序
    pub async fn find_sessions_waiting_for_pc(&self) -> RelayResult<Vec<Session>> {
        let now = now_millis();
        let stale_after = self.config.pc_stale_after_ms();

        let mut sessions: Vec<Session> = self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| !s.pc_is_fresh(now, stale_after))
            .collect();

        sessions.sort_by(|a, b| {
            b.has_mobile()
                .cmp(&a.has_mobile())
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(sessions)
    }

    /// 至少有一个 mobile 的会话，按创建时间倒序
    pub async fn find_sessions_with_mobile(&self) -> RelayResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .filter(Session::has_mobile)
            .collect();

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::{RelayMessage, SqliteStore};
    use serde_json::json;

    fn setup() -> (SessionStore, Arc<dyn StoreAdapter>) {
        let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::in_memory().unwrap());
        let sessions = SessionStore::new(store.clone(), Arc::new(RelayConfig::default()));
        (sessions, store)
    }

    #[test]
    fn test_generate_session_id() {
        for _ in 0..100 {
            let id = generate_session_id();
            assert_eq!(id.len(), SESSION_ID_LEN);
            assert!(id.bytes().all(|b| SESSION_ID_ALPHABET.contains(&b)));
            assert!(!id.contains(['0', 'O', '1', 'I']));
        }
    }

    #[test]
    fn test_hash_pin_is_salted_by_session() {
        let a = hash_pin("ABC234", "1234");
        assert_eq!(a.len(), 64);
        assert_eq!(a, hash_pin("ABC234", "1234"));
        assert_ne!(a, hash_pin("XYZ789", "1234"));
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (sessions, _) = setup();
        let session = sessions.create().await.unwrap();
        assert!(session.expires_at > session.created_at);

        let fetched = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(fetched.session_id, session.session_id);
        assert!(matches!(
            sessions.get("ZZZZZZ").await,
            Err(RelayError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_join_unknown_session() {
        let (sessions, _) = setup();
        let result = sessions.join("ZZZZZZ", "M1", DeviceType::Mobile, None).await;
        assert!(matches!(result, Err(RelayError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_mobile_join_is_idempotent() {
        let (sessions, _) = setup();
        let id = sessions.create().await.unwrap().session_id;

        sessions.join(&id, "M1", DeviceType::Mobile, None).await.unwrap();
        let session = sessions.join(&id, "M1", DeviceType::Mobile, None).await.unwrap();
        assert_eq!(session.mobile_device_ids.len(), 1);

        let session = sessions.join(&id, "M2", DeviceType::Mobile, None).await.unwrap();
        assert_eq!(session.mobile_device_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_pin_gate() {
        let (sessions, _) = setup();
        let id = sessions.create().await.unwrap().session_id;
        let session = sessions
            .join(&id, "P1", DeviceType::Pc, Some("4321"))
            .await
            .unwrap();
        assert!(session.has_pin());

        assert!(matches!(
            sessions.join(&id, "M1", DeviceType::Mobile, None).await,
            Err(RelayError::PinRequired)
        ));
        assert!(matches!(
            sessions.join(&id, "M1", DeviceType::Mobile, Some("0000")).await,
            Err(RelayError::InvalidPin)
        ));
        sessions
            .join(&id, "M1", DeviceType::Mobile, Some("4321"))
            .await
            .unwrap();

        // 同一台 PC 不带 PIN 重连，PIN 保留
        let session = sessions.join(&id, "P1", DeviceType::Pc, None).await.unwrap();
        assert!(session.has_pin());

        // 换 PC 必须带对 PIN，PIN 保持不变
        assert!(matches!(
            sessions.join(&id, "P2", DeviceType::Pc, None).await,
            Err(RelayError::PinRequired)
        ));
        assert!(matches!(
            sessions.join(&id, "P2", DeviceType::Pc, Some("0000")).await,
            Err(RelayError::InvalidPin)
        ));
        let session = sessions
            .join(&id, "P2", DeviceType::Pc, Some("4321"))
            .await
            .unwrap();
        assert!(session.has_pin());
        assert_eq!(session.pc_device_id.as_deref(), Some("P2"));
        assert!(matches!(
            sessions.join(&id, "M9", DeviceType::Mobile, None).await,
            Err(RelayError::PinRequired)
        ));
    }

    #[tokio::test]
    async fn test_pc_takeover_requires_stale_pc() {
        let (sessions, store) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions.join(&id, "P1", DeviceType::Pc, None).await.unwrap();

        assert!(matches!(
            sessions.join(&id, "P2", DeviceType::Pc, None).await,
            Err(RelayError::Forbidden(_))
        ));
        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.pc_device_id.as_deref(), Some("P1"));

        // P1 超过 2 分钟未出现，允许接管
        let aged = now_millis() - 3 * 60 * 1000;
        store.touch_pc(&id, "P1", aged).await.unwrap();
        let session = sessions.join(&id, "P2", DeviceType::Pc, None).await.unwrap();
        assert_eq!(session.pc_device_id.as_deref(), Some("P2"));
    }

    #[tokio::test]
    async fn test_stale_pc_with_pin_still_needs_pin() {
        let (sessions, store) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions
            .join(&id, "P1", DeviceType::Pc, Some("4321"))
            .await
            .unwrap();
        store
            .touch_pc(&id, "P1", now_millis() - 3 * 60 * 1000)
            .await
            .unwrap();

        assert!(matches!(
            sessions.join(&id, "EVIL", DeviceType::Pc, None).await,
            Err(RelayError::PinRequired)
        ));
        let session = sessions.get(&id).await.unwrap();
        assert!(session.has_pin());
        assert_eq!(session.pc_device_id.as_deref(), Some("P1"));
    }

    #[tokio::test]
    async fn test_join_binds_device() {
        let (sessions, _) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions.join(&id, "M1", DeviceType::Mobile, None).await.unwrap();

        assert_eq!(sessions.resolve_session_id(None, Some("M1")).await.unwrap(), id);
        assert_eq!(
            sessions.resolve_session_id(Some("ABC234"), Some("M1")).await.unwrap(),
            "ABC234"
        );
        assert!(matches!(
            sessions.resolve_session_id(None, Some("unknown")).await,
            Err(RelayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registered_pc() {
        let (sessions, _) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions.join(&id, "P1", DeviceType::Pc, None).await.unwrap();

        assert!(matches!(
            sessions.heartbeat(&id, "P2").await,
            Err(RelayError::Forbidden(_))
        ));
        let session = sessions.heartbeat(&id, "P1").await.unwrap();
        assert!(session.pc_last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_mobile_leave_purges_its_queue() {
        let (sessions, store) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions.join(&id, "M1", DeviceType::Mobile, None).await.unwrap();

        let message = RelayMessage {
            id: "m1".to_string(),
            message_type: "output".to_string(),
            from: DeviceType::Pc,
            to: DeviceType::Mobile,
            data: json!({}),
            timestamp: now_millis(),
        };
        let target = QueueTarget::Mobile("M1".to_string());
        store
            .push_message(&id, &target, &message, now_millis() + 60_000)
            .await
            .unwrap();

        let session = sessions.leave(&id, "M1", DeviceType::Mobile).await.unwrap();
        assert!(!session.has_mobile());
        assert!(!store.has_messages(&id, &target).await.unwrap());
    }

    #[tokio::test]
    async fn test_discovery_transition() {
        let (sessions, store) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions.join(&id, "M1", DeviceType::Mobile, None).await.unwrap();

        let waiting = sessions.find_sessions_waiting_for_pc().await.unwrap();
        assert!(waiting.iter().any(|s| s.session_id == id));

        let session = sessions.join(&id, "P1", DeviceType::Pc, None).await.unwrap();
        assert!(sessions.touch_if_pc(&session, "P1").await.unwrap());
        let waiting = sessions.find_sessions_waiting_for_pc().await.unwrap();
        assert!(!waiting.iter().any(|s| s.session_id == id));

        // PC last seen 超过 2 分钟
        let aged = now_millis() - 3 * 60 * 1000;
        store.touch_pc(&id, "P1", aged).await.unwrap();
        let waiting = sessions.find_sessions_waiting_for_pc().await.unwrap();
        assert!(waiting.iter().any(|s| s.session_id == id));
    }

    #[tokio::test]
    async fn test_waiting_sessions_prefer_mobile() {
        let (sessions, _) = setup();
        let with_mobile = sessions.create().await.unwrap().session_id;
        sessions
            .join(&with_mobile, "M1", DeviceType::Mobile, None)
            .await
            .unwrap();
        let empty = sessions.create().await.unwrap().session_id;

        let waiting = sessions.find_sessions_waiting_for_pc().await.unwrap();
        assert_eq!(waiting[0].session_id, with_mobile);
        assert!(waiting.iter().any(|s| s.session_id == empty));

        let with_mobile_only = sessions.find_sessions_with_mobile().await.unwrap();
        assert_eq!(with_mobile_only.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let (sessions, _) = setup();
        let id = sessions.create().await.unwrap().session_id;
        sessions.delete(&id).await.unwrap();
        assert!(matches!(
            sessions.delete(&id).await,
            Err(RelayError::SessionNotFound)
        ));
    }
}
