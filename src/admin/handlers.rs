use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::guardrail::{ChainMetrics, ErrorMetrics, GuardrailAction};
use crate::resilience::caller::CallerStatus;
use crate::resilience::circuit_breaker::BreakerStatus;
use crate::resilience::rate_limit::LimiterStatus;

const RECENT_ACTIONS_LIMIT: usize = 20;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub kill_switch_active: bool,
    pub backoff_active: bool,
    pub services: Vec<CallerStatus>,
}

#[derive(Serialize)]
pub struct GuardrailReport {
    pub chains: Vec<ChainMetrics>,
    pub errors: ErrorMetrics,
    pub active_actions: Vec<GuardrailAction>,
    pub recent_actions: Vec<GuardrailAction>,
}

#[derive(Debug, Deserialize)]
pub struct KillRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResetRequest {
    pub chain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SwitchResponse {
    /// Whether the call changed state.
    pub changed: bool,
    pub kill_switch_active: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let guardrail = &state.services.guardrail;
    let services: Vec<_> = state.services.callers().map(|c| c.status()).collect();
    let kill_switch_active = guardrail.is_kill_switch_active(None);

    let status = if kill_switch_active {
        "killed"
    } else if services.iter().all(|s| s.healthy) {
        "operational"
    } else {
        "degraded"
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        kill_switch_active,
        backoff_active: guardrail.is_backoff_active(),
        services,
    })
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<Vec<BreakerStatus>> {
    Json(state.services.breakers.statuses())
}

pub async fn get_limiters(State(state): State<AdminState>) -> Json<Vec<LimiterStatus>> {
    Json(state.services.limiter.statuses())
}

pub async fn get_guardrails(State(state): State<AdminState>) -> Json<GuardrailReport> {
    let guardrail = &state.services.guardrail;
    Json(GuardrailReport {
        chains: guardrail.all_chain_metrics(),
        errors: guardrail.error_metrics(),
        active_actions: guardrail.active_actions(),
        recent_actions: guardrail.recent_actions(RECENT_ACTIONS_LIMIT),
    })
}

pub async fn post_kill_switch(
    State(state): State<AdminState>,
    Json(request): Json<KillRequest>,
) -> Result<Json<SwitchResponse>, ApiError> {
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "reason must not be empty"));
    }
    tracing::warn!(reason = %reason, "Manual kill switch requested via admin API");
    let changed = state.services.guardrail.manual_kill_switch(reason);
    Ok(Json(SwitchResponse {
        changed,
        kill_switch_active: true,
    }))
}

pub async fn post_kill_switch_reset(
    State(state): State<AdminState>,
    Json(request): Json<ResetRequest>,
) -> Json<SwitchResponse> {
    let guardrail = &state.services.guardrail;
    let changed = guardrail.reset_kill_switch(request.chain.as_deref());
    Json(SwitchResponse {
        changed,
        kill_switch_active: guardrail.is_kill_switch_active(request.chain.as_deref()),
    })
}

pub async fn post_breaker_action(
    State(state): State<AdminState>,
    Path((service, action)): Path<(String, String)>,
) -> Result<Json<BreakerStatus>, ApiError> {
    let breaker = state
        .services
        .breakers
        .get(&service)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown service '{}'", service)))?;

    match action.as_str() {
        "open" => breaker.force_open(),
        "close" => breaker.force_close(),
        "reset" => breaker.reset(),
        other => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown breaker action '{}'", other),
            ))
        }
    }
    tracing::info!(service = %service, action = %action, "Breaker override via admin API");
    Ok(Json(breaker.status()))
}
