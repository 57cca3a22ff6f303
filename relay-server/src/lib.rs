//! Relay HTTP 层
//!
//! axum 路由、统一响应信封、长轮询流。业务都在 `relay-logic` 里。

pub mod config;
pub mod envelope;
pub mod routes;
pub mod stream;

use axum::routing::{get, post};
use axum::Router;
use relay_logic::RelayService;
use std::sync::Arc;

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RelayService>,
}

/// 构建路由
pub fn build_router(service: Arc<RelayService>) -> Router {
    use routes::*;

    Router::new()
        .route(
            "/session",
            post(create_session)
                .get(get_session)
                .delete(delete_session)
                .fallback(method_not_allowed),
        )
        .route("/connect", post(connect).fallback(method_not_allowed))
        .route("/disconnect", post(disconnect).fallback(method_not_allowed))
        .route("/send", post(send).fallback(method_not_allowed))
        .route("/poll", get(poll).fallback(method_not_allowed))
        .route("/stream", get(stream::stream).fallback(method_not_allowed))
        .route("/heartbeat", get(heartbeat).fallback(method_not_allowed))
        .route(
            "/command-approvals",
            get(list_approvals).fallback(method_not_allowed),
        )
        .route(
            "/resolve-command-approval",
            post(resolve_approval).fallback(method_not_allowed),
        )
        .route(
            "/command-events",
            get(list_command_events)
                .post(append_command_event)
                .fallback(method_not_allowed),
        )
        .route(
            "/command-timeline-summary",
            get(timeline_summary).fallback(method_not_allowed),
        )
        .route(
            "/sessions-waiting-for-pc",
            get(sessions_waiting_for_pc).fallback(method_not_allowed),
        )
        .route(
            "/sessions-with-mobile",
            get(sessions_with_mobile).fallback(method_not_allowed),
        )
        .route("/health", get(health).fallback(method_not_allowed))
        .route("/store", get(store_info).fallback(method_not_allowed))
        .fallback(not_found)
        .with_state(AppState { service })
}
