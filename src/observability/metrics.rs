//! Metrics collection and exposition.
//!
//! # Metrics
//! - `upstream_calls_total` (counter): terminal call outcomes by service, status, attempts
//! - `upstream_call_duration_seconds` (histogram): call latency including retries
//! - `circuit_breaker_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `circuit_breaker_rejections_total` (counter): calls refused by an open breaker
//! - `rate_limit_rejections_total` (counter): admissions refused, by reason
//! - `rate_limit_blocks_total` (counter): 429-triggered blocks
//! - `guardrail_actions_total` (counter): mitigation actions by type
//! - `guardrail_alerts_total` (counter): alerts recorded per chain
//!
//! All recording functions are no-ops until a recorder is installed, so
//! library code and tests can call them unconditionally.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

use crate::resilience::circuit_breaker::CircuitState;

const CALL_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("upstream_call_duration_seconds".to_string()),
            CALL_DURATION_BUCKETS,
        )?
        .install()?;

    describe();
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

fn describe() {
    ::metrics::describe_counter!("upstream_calls_total", "Terminal outcomes of upstream calls");
    ::metrics::describe_histogram!(
        "upstream_call_duration_seconds",
        ::metrics::Unit::Seconds,
        "Upstream call latency including retries"
    );
    ::metrics::describe_gauge!("circuit_breaker_state", "0=closed, 1=open, 2=half-open");
    ::metrics::describe_counter!("circuit_breaker_rejections_total", "Calls refused by a circuit breaker");
    ::metrics::describe_counter!("rate_limit_rejections_total", "Calls refused by the rate limiter");
    ::metrics::describe_counter!("rate_limit_blocks_total", "Blocks applied after 429 responses");
    ::metrics::describe_counter!("guardrail_actions_total", "Guardrail mitigation actions");
    ::metrics::describe_counter!("guardrail_alerts_total", "Alerts recorded by the guardrail");
}

pub fn record_call(service: &str, status: &'static str, attempts: u32, duration: Duration) {
    ::metrics::counter!(
        "upstream_calls_total",
        "service" => service.to_string(),
        "status" => status,
        "attempts" => attempts.to_string()
    )
    .increment(1);
    ::metrics::histogram!(
        "upstream_call_duration_seconds",
        "service" => service.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
}

pub fn record_breaker_state(service: &str, state: CircuitState) {
    ::metrics::gauge!("circuit_breaker_state", "service" => service.to_string()).set(state.as_gauge());
}

pub fn record_breaker_rejection(service: &str) {
    ::metrics::counter!("circuit_breaker_rejections_total", "service" => service.to_string()).increment(1);
}

pub fn record_rate_limited(service: &str, reason: &'static str) {
    ::metrics::counter!(
        "rate_limit_rejections_total",
        "service" => service.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_rate_limit_block(service: &str) {
    ::metrics::counter!("rate_limit_blocks_total", "service" => service.to_string()).increment(1);
}

pub fn record_guardrail_action(action_type: &'static str) {
    ::metrics::counter!("guardrail_actions_total", "type" => action_type).increment(1);
}

pub fn record_alert(chain: &str) {
    ::metrics::counter!("guardrail_alerts_total", "chain" => chain.to_string()).increment(1);
}
