//! Authenticated admin API over the running guard.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::startup::GuardServices;

/// Shared handler state.
#[derive(Clone)]
pub struct AdminState {
    pub services: Arc<GuardServices>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(services: Arc<GuardServices>, api_key: &str) -> Self {
        Self {
            services,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/limiters", get(get_limiters))
        .route("/admin/guardrails", get(get_guardrails))
        .route("/admin/kill-switch", post(post_kill_switch))
        .route("/admin/kill-switch/reset", post(post_kill_switch_reset))
        .route("/admin/breakers/{service}/{action}", post(post_breaker_action))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
