//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build journal, guardrail, limiter, breakers, callers
//!
//! Background (ticker.rs):
//!     Guardrail sweep every sweep_interval_secs
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → broadcast → tickers, watcher and admin server exit
//! ```

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod ticker;

pub use shutdown::Shutdown;
pub use startup::GuardServices;
pub use ticker::{Ticker, TickerHandle};
