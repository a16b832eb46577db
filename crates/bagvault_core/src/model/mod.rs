//! Vault domain model.
//!
//! # Responsibility
//! - Define the records shared by repositories and services.
//! - Keep lifecycle states as tagged variants so illegal transitions are
//!   visible at the call site.
//!
//! # Invariants
//! - Every entity is addressed by a stable UUID, never by a path.
//! - Timestamps are Unix epoch milliseconds.

pub mod event;
pub mod package;
pub mod project;
pub mod quarantine;
pub mod snapshot;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
