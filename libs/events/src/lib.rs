//! # runbay-events
//!
//! Flow event type definitions and serialization for the runbay orchestrator.
//!
//! ## Design Principles
//!
//! - Flow events are immutable records of run lifecycle transitions
//! - Flow events never contain credentials (MCP tokens and access keys stay
//!   out of payloads)
//! - Every flow event belongs to exactly one run and one correlation chain
//! - Terminal events are emitted at most once per run
//!
//! ## Event Types
//!
//! - Run lifecycle (`run.started`, `run.succeeded`, `run.failed.*`,
//!   `run.canceled`)
//! - Namespace leases (`run.namespace.*`)
//! - Agent profile (`run.profile.resolved`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
