//! System-wide guardrails.
//!
//! # Data Flow
//! ```text
//! alert sender ── admit_alert / record_alert ──▶ controller.rs
//! ResilientCaller ── record_request(success) ──▶ controller.rs
//! sweep ticker ── run_checks ──────────────────▶ controller.rs
//!                                                   │
//!                       GuardrailEvent (broadcast) ◀┤
//!                       journal.rs (JSON lines)    ◀┘
//! ```
//!
//! Collectors and alert senders consult the controller before acting; the
//! controller never calls them.

pub mod controller;
pub mod journal;
pub mod types;

pub use controller::GuardrailController;
pub use journal::{ActionJournal, FileJournal, JournalError, MemoryJournal};
pub use types::{
    ActionType, AlertDecision, ChainMetrics, ErrorMetrics, GuardrailAction, GuardrailEvent, GuardrailThresholds,
};
