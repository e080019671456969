//! runbay run orchestrator library.
//!
//! This crate primarily ships a `run-orchestrator` binary, but we expose the
//! library surface to enable integration testing and reuse.

pub mod agent_context;
pub mod config;
pub mod credentials;
pub mod db;
pub mod execution_context;
pub mod image;
pub mod launcher;
pub mod namespace_policy;
pub mod orchestrator;
pub mod payload;
pub mod preparer;

pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorError, OrchestratorWorker, TickStats,
};
