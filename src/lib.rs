//! swarmforge - multi-agent build orchestrator
//!
//! Drives a fleet of LLM agents (architect, frontend/backend dev, styling,
//! reviewers, remediation) through a dependency-aware DAG against a project
//! checkout, with budget enforcement, crash recovery, and a broadcast bus
//! for progress updates. The web UI, transport layer, preview dev-server
//! lifecycle, git-backed versioning, and provider SDKs are external
//! collaborators this crate only speaks to through narrow contracts.

pub mod agent;
pub mod bus;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod extract;
pub mod http_client;
pub mod observability;
pub mod plan;
pub mod provider;
pub mod registry;
pub mod remediation;
pub mod review;
pub mod scheduler;
pub mod store;
pub mod tools;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use scheduler::{PipelineOutcome, PipelineRequest, Scheduler};
pub use store::Store;

/// Crate version, as reported by `swarmforge --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
