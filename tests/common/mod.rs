//! Shared helpers for integration tests.

use axum::body::Body;
use axum::http::{header, Method, Request};
use std::sync::Arc;

use pulse_guard::config::schema::{CircuitBreakerConfig, RateLimitConfig, RetryConfig, ServiceConfig};
use pulse_guard::{GuardServices, PulseGuardConfig};

#[allow(dead_code)]
pub const API_KEY: &str = "test-admin-key";

/// Default configuration with an in-memory journal.
pub fn test_config() -> PulseGuardConfig {
    let mut config = PulseGuardConfig::default();
    config.guardrail.journal_path = None;
    config
}

/// A service that never retries and has no rate limit.
#[allow(dead_code)]
pub fn single_attempt_service(failure_threshold: u32, reset_timeout_ms: u64) -> ServiceConfig {
    ServiceConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
            expected_errors: Vec::new(),
        },
        rate_limit: RateLimitConfig::default(),
        retry: RetryConfig {
            max_attempts: Some(1),
            jitter: Some(false),
            ..Default::default()
        },
        default_timeout_ms: 1_000,
    }
}

/// Build services from `config`.
pub fn services(config: PulseGuardConfig) -> Arc<GuardServices> {
    Arc::new(GuardServices::build(config).expect("build services"))
}

/// Admin request carrying the test API key.
#[allow(dead_code)]
pub fn admin_request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY));
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}
