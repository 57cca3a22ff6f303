//! 有界长轮询（SSE）
//!
//! 在一个固定窗口内按间隔检查队列，有消息就推 `message` 事件，定期推 `heartbeat`，
//! 窗口结束时推 `reconnect`，客户端收到后重新发起请求。

use crate::envelope::ApiError;
use crate::routes::PollQuery;
use crate::AppState;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream};
use relay_logic::{PollRequest, RelayService};
use relay_store::{now_millis, DeviceType};
use serde_json::json;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct StreamState {
    service: Arc<RelayService>,
    session_id: String,
    device_type: DeviceType,
    device_id: Option<String>,
    started: Instant,
    last_heartbeat: Instant,
    window: Duration,
    heartbeat: Duration,
    check_interval: Duration,
    pending: VecDeque<Event>,
    finished: bool,
}

impl StreamState {
    /// 检查队列并把消息转成事件；出错时结束本轮
    async fn drain(&mut self) {
        let has_pending = self
            .service
            .has_pending(&self.session_id, self.device_type, self.device_id.as_deref())
            .await;

        match has_pending {
            Ok(false) => {}
            Ok(true) => {
                let request = PollRequest {
                    session_id: Some(self.session_id.clone()),
                    device_id: self.device_id.clone(),
                    device_type: self.device_type,
                    limit: None,
                };
                match self.service.poll(request).await {
                    Ok(outcome) => {
                        for message in outcome.messages {
                            match Event::default().event("message").json_data(&message) {
                                Ok(event) => self.pending.push_back(event),
                                Err(e) => warn!("[Stream] Failed to encode message {}: {}", message.id, e),
                            }
                        }
                    }
                    Err(e) => self.fail(&e.to_string()),
                }
            }
            Err(e) => self.fail(&e.to_string()),
        }
    }

    /// PC 的在线时间随心跳一起刷新
    async fn touch_presence(&mut self) {
        let touched = self
            .service
            .refresh_presence(&self.session_id, self.device_type, self.device_id.as_deref())
            .await;
        if let Err(e) = touched {
            self.fail(&e.to_string());
        }
    }

    fn fail(&mut self, detail: &str) {
        warn!("[Stream] Session {} stream aborted: {}", self.session_id, detail);
        self.pending
            .push_back(Event::default().event("error").data("stream interrupted"));
        self.pending.push_back(reconnect_event());
        self.finished = true;
    }
}

fn reconnect_event() -> Event {
    Event::default()
        .event("reconnect")
        .data(json!({ "timestamp": now_millis() }).to_string())
}

fn heartbeat_event() -> Event {
    Event::default()
        .event("heartbeat")
        .data(json!({ "timestamp": now_millis() }).to_string())
}

fn event_stream(state: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            if state.started.elapsed() >= state.window {
                debug!("[Stream] Window elapsed for {}", state.session_id);
                state.finished = true;
                return Some((Ok(reconnect_event()), state));
            }

            state.drain().await;
            if !state.pending.is_empty() {
                continue;
            }

            if state.last_heartbeat.elapsed() >= state.heartbeat {
                state.last_heartbeat = Instant::now();
                state.touch_presence().await;
                if !state.pending.is_empty() {
                    continue;
                }
                return Some((Ok(heartbeat_event()), state));
            }
            tokio::time::sleep(state.check_interval).await;
        }
    })
}

/// GET /stream
pub async fn stream(
    State(app): State<AppState>,
    query: Result<Query<PollQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let request = query.into_request()?;

    // 会话不存在时直接返回错误信封，而不是开流
    let session_id = app
        .service
        .sessions()
        .resolve_session_id(request.session_id.as_deref(), request.device_id.as_deref())
        .await?;
    app.service
        .refresh_presence(&session_id, request.device_type, request.device_id.as_deref())
        .await?;

    let config = app.service.config();
    let now = Instant::now();
    let state = StreamState {
        service: app.service.clone(),
        session_id,
        device_type: request.device_type,
        device_id: request.device_id.filter(|id| !id.trim().is_empty()),
        started: now,
        last_heartbeat: now,
        window: config.long_poll_window,
        heartbeat: config.long_poll_heartbeat,
        check_interval: config.long_poll_check_interval,
        pending: VecDeque::new(),
        finished: false,
    };

    Ok(Sse::new(event_stream(state))
        .keep_alive(KeepAlive::default())
        .into_response())
}
