//! # runbay-id
//!
//! Stable ID types, parsing, and derivation for the runbay orchestrator.
//!
//! ## Design Principles
//!
//! - Run and project IDs are UUIDs so they map directly onto store columns
//! - IDs are typed to prevent mixing a run ID with a project ID
//! - Project IDs can be derived deterministically from a repository name,
//!   so every scheduler instance computes the same identity independently
//! - `compact(n)` gives a short, DNS-safe fragment used in namespace and
//!   branch names
//!
//! ## ID Format
//!
//! IDs render as lower-case hyphenated UUIDs:
//!
//! - `1f0c6a52-8d7e-4c1b-9a33-5e0b2f7c9d14`
//!
//! Parsing also accepts the 32-character simple form.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
