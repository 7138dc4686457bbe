//! Error taxonomy for outbound dependency calls.
//!
//! Upstream failures are classified once, at the boundary where the call is
//! made, into [`UpstreamError`]. Retry and circuit-breaker decisions operate on
//! its [`ErrorKind`] rather than inspecting messages or status fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitState;

/// Coarse classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    ServerError,
    ClientError,
    Decode,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Decode => "decode",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionReset,
    ConnectionRefused,
    Dns,
    TimedOut,
    Other,
}

/// Deadline exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation '{name}' timed out after {}ms", .timeout.as_millis())]
pub struct TimeoutError {
    pub name: String,
    pub timeout: Duration,
}

/// A failed upstream call, classified at the call site.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("network error ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        /// Provider-supplied `Retry-After`, in seconds.
        retry_after: Option<u64>,
        message: String,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        UpstreamError::Network {
            kind,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        UpstreamError::Http {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    /// A 429 response with an optional `Retry-After` value.
    pub fn rate_limited(retry_after: Option<u64>) -> Self {
        UpstreamError::Http {
            status: 429,
            retry_after,
            message: "Too Many Requests".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::Network { .. } => ErrorKind::Network,
            UpstreamError::Timeout(_) => ErrorKind::Timeout,
            UpstreamError::Http { status: 429, .. } => ErrorKind::RateLimited,
            UpstreamError::Http { status, .. } if *status >= 500 => ErrorKind::ServerError,
            UpstreamError::Http { status, .. } if *status >= 400 => ErrorKind::ClientError,
            UpstreamError::Http { .. } => ErrorKind::Other,
            UpstreamError::Decode(_) => ErrorKind::Decode,
            UpstreamError::Other(_) => ErrorKind::Other,
        }
    }

    /// `Retry-After` seconds carried by a 429, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            UpstreamError::Http {
                status: 429,
                retry_after,
                ..
            } => *retry_after,
            _ => None,
        }
    }

    /// Default retry eligibility: connection resets, timeouts, DNS failures,
    /// 5xx and 429. Other 4xx are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Network { kind, .. } => matches!(
                kind,
                NetworkErrorKind::ConnectionReset | NetworkErrorKind::TimedOut | NetworkErrorKind::Dns
            ),
            UpstreamError::Timeout(_) => true,
            UpstreamError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            UpstreamError::Decode(_) | UpstreamError::Other(_) => false,
        }
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match e.kind() {
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => {
                NetworkErrorKind::ConnectionReset
            }
            Io::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            Io::TimedOut => NetworkErrorKind::TimedOut,
            _ => NetworkErrorKind::Other,
        };
        UpstreamError::network(kind, e.to_string())
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return UpstreamError::http(status.as_u16(), e.to_string());
        }
        if e.is_decode() {
            return UpstreamError::Decode(e.to_string());
        }
        let kind = if e.is_timeout() {
            NetworkErrorKind::TimedOut
        } else if e.is_connect() {
            connect_failure_kind(&e)
        } else if e.is_request() || e.is_body() {
            NetworkErrorKind::ConnectionReset
        } else {
            NetworkErrorKind::Other
        };
        UpstreamError::network(kind, e.to_string())
    }
}

/// Classify a connect failure by walking its source chain.
///
/// Resolver failures carry no public type: hyper-util 0.1's legacy
/// `HttpConnector` wraps them in a private `ConnectError` whose message is
/// `"dns error"`. Revisit when reqwest moves off hyper-util 0.1.
fn connect_failure_kind(err: &(dyn std::error::Error + 'static)) -> NetworkErrorKind {
    let mut current = Some(err);
    while let Some(level) = current {
        if let Some(io) = level.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::TimedOut,
                std::io::ErrorKind::ConnectionReset => return NetworkErrorKind::ConnectionReset,
                std::io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
                _ => {}
            }
        }
        if level.to_string() == "dns error" {
            return NetworkErrorKind::Dns;
        }
        current = level.source();
    }
    NetworkErrorKind::ConnectionRefused
}

/// Call rejected because the dependency's breaker is not admitting.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker for '{service}' is {state}")]
pub struct CircuitBreakerError {
    pub service: String,
    pub state: CircuitState,
    /// Time until the breaker admits a trial call, when known.
    pub next_attempt_in: Option<Duration>,
}

/// Why the rate limiter refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Blocked,
    TokensExhausted,
    MinuteWindow,
    HourWindow,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Blocked => "blocked",
            RejectReason::TokensExhausted => "tokens_exhausted",
            RejectReason::MinuteWindow => "minute_window",
            RejectReason::HourWindow => "hour_window",
        }
    }
}

/// Pre-flight rejection by the rate limiter. Not an upstream failure.
#[derive(Debug, Clone, Error)]
#[error("rate limit for '{service}' rejected request ({})", .reason.as_str())]
pub struct RateLimitRejection {
    pub service: String,
    pub reason: RejectReason,
    pub retry_after: Option<Duration>,
}

/// Every attempt failed; carries each attempt's error in order.
#[derive(Debug, Clone, Error)]
#[error("all {attempts} attempts failed after {}ms; last error: {}", .total_elapsed.as_millis(), describe_last(.errors))]
pub struct RetryExhaustedError {
    pub attempts: u32,
    pub total_elapsed: Duration,
    pub errors: Vec<UpstreamError>,
}

impl RetryExhaustedError {
    pub fn last_error(&self) -> Option<&UpstreamError> {
        self.errors.last()
    }

    /// True when every attempt hit its deadline.
    pub fn all_timed_out(&self) -> bool {
        !self.errors.is_empty()
            && self
                .errors
                .iter()
                .all(|e| matches!(e, UpstreamError::Timeout(_)))
    }
}

fn describe_last(errors: &[UpstreamError]) -> String {
    errors
        .last()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Final failure returned by [`ResilientCaller`](crate::resilience::caller::ResilientCaller).
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitRejection),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),

    /// Every attempt exceeded its deadline.
    #[error("{source} ({attempts} attempts)")]
    Timeout {
        source: TimeoutError,
        attempts: u32,
    },

    #[error(transparent)]
    RetryExhausted(#[from] RetryExhaustedError),
}

impl ResilienceError {
    /// Outcome label used in metrics and logs.
    pub fn status_label(&self) -> &'static str {
        match self {
            ResilienceError::RateLimited(_) => "rate_limited",
            ResilienceError::CircuitOpen(_) => "circuit_open",
            ResilienceError::Timeout { .. } => "timeout",
            ResilienceError::RetryExhausted(_) => "retry_exhausted",
        }
    }

    /// Control-plane rejection (no upstream request was made).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::RateLimited(_) | ResilienceError::CircuitOpen(_)
        )
    }
}

/// Maps an error to its [`ErrorKind`] for breaker accounting.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for UpstreamError {
    fn kind(&self) -> ErrorKind {
        UpstreamError::kind(self)
    }
}

impl Classify for TimeoutError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

impl Classify for RetryExhaustedError {
    fn kind(&self) -> ErrorKind {
        self.last_error()
            .map(UpstreamError::kind)
            .unwrap_or(ErrorKind::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_classification() {
        assert_eq!(UpstreamError::http(503, "down").kind(), ErrorKind::ServerError);
        assert_eq!(UpstreamError::http(404, "missing").kind(), ErrorKind::ClientError);
        assert_eq!(UpstreamError::rate_limited(Some(5)).kind(), ErrorKind::RateLimited);
        assert_eq!(UpstreamError::rate_limited(Some(5)).retry_after(), Some(5));
        assert_eq!(UpstreamError::http(503, "down").retry_after(), None);
    }

    #[test]
    fn test_default_transient_set() {
        assert!(UpstreamError::http(500, "boom").is_transient());
        assert!(UpstreamError::rate_limited(None).is_transient());
        assert!(!UpstreamError::http(400, "bad").is_transient());
        assert!(!UpstreamError::http(401, "auth").is_transient());
        assert!(UpstreamError::network(NetworkErrorKind::ConnectionReset, "reset").is_transient());
        assert!(UpstreamError::network(NetworkErrorKind::Dns, "nxdomain").is_transient());
        assert!(!UpstreamError::network(NetworkErrorKind::ConnectionRefused, "refused").is_transient());
        assert!(!UpstreamError::Decode("bad json".into()).is_transient());

        let timeout = TimeoutError {
            name: "dexscreener".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(UpstreamError::from(timeout).is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: UpstreamError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset").into();
        assert!(matches!(
            err,
            UpstreamError::Network {
                kind: NetworkErrorKind::ConnectionReset,
                ..
            }
        ));
    }

    #[derive(Debug, Error)]
    #[error("{message}")]
    struct Wrapped {
        message: &'static str,
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn test_connect_failures_classified_from_source_chain() {
        let dns = Wrapped {
            message: "dns error",
            source: std::io::Error::new(std::io::ErrorKind::Other, "failed to lookup address information"),
        };
        assert_eq!(connect_failure_kind(&dns), NetworkErrorKind::Dns);

        let refused = Wrapped {
            message: "tcp connect error",
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
        };
        assert_eq!(connect_failure_kind(&refused), NetworkErrorKind::ConnectionRefused);

        let timed_out = Wrapped {
            message: "tcp connect error",
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        };
        assert_eq!(connect_failure_kind(&timed_out), NetworkErrorKind::TimedOut);
    }

    #[test]
    fn test_retry_exhausted_keeps_all_errors() {
        let err = RetryExhaustedError {
            attempts: 2,
            total_elapsed: Duration::from_millis(1500),
            errors: vec![UpstreamError::http(502, "a"), UpstreamError::http(503, "b")],
        };
        assert_eq!(err.errors.len(), 2);
        assert_eq!(Classify::kind(&err), ErrorKind::ServerError);
        assert!(!err.all_timed_out());
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_error_kind_serde_names() {
        let kinds: Vec<ErrorKind> = serde_json::from_str(r#"["rate_limited","timeout"]"#).unwrap();
        assert_eq!(kinds, vec![ErrorKind::RateLimited, ErrorKind::Timeout]);
    }
}
