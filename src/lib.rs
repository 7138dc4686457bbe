//! Resilience and flow control for outbound calls to third-party services.
//!
//! Each upstream gets a [`ResilientCaller`] that composes a token-bucket
//! rate limiter, a circuit breaker, retries with backoff and a per-attempt
//! timeout. A [`GuardrailController`] watches alert volume and the global
//! error rate and applies mutes, backoffs and kill switches.

pub mod admin;
pub mod clock;
pub mod config;
pub mod guardrail;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use clock::Clock;
pub use config::schema::PulseGuardConfig;
pub use guardrail::GuardrailController;
pub use lifecycle::{GuardServices, Shutdown};
pub use resilience::caller::ResilientCaller;
pub use resilience::error::ResilienceError;
