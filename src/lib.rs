//! Pod checkpointer
//!
//! Keeps self-hosted control-plane pods running on a node while the cluster
//! API server is unreachable. While the API server answers, live copies of
//! checkpoint-eligible pods are stored on local disk as inert static pod
//! manifests; when it stops answering, those manifests are handed to the node
//! agent so the pods keep running until the cluster recovers.
//!
//! The system is organized into functional modules:
//! - **error**: error types per concern
//! - **models**: pod, identity and agent-view data types
//! - **config**: configuration file, environment overrides, marker predicates
//! - **client**: cluster API and node agent clients
//! - **checkpoint**: manifest transformation and the on-disk store
//! - **orchestrator**: the reconciliation loop
//! - **system**: host identity, signals, polling helpers
//! - **log_collector**: the process-wide log sink

pub mod error;
pub mod models;

pub mod config;

pub mod client;

pub mod checkpoint;

pub mod orchestrator;

pub mod system;

pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    AgentError, ClusterError, ConfigError, ReconcileError, Result, StoreError, TransformError,
    WaitError,
};

pub use models::{ActiveLocalPod, LocalPods, ParentPod, Pod, PodIdentity, PodPhase};

pub use config::CheckpointerConfig;

pub use client::{AgentClient, ClusterApi, ClusterClient, LocalAgent};

pub use checkpoint::{CheckpointManifest, CheckpointStore};

pub use orchestrator::{CheckpointController, SyncStatus, TickMode, TickOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_error_reexport() {
        let _: Result<i32> = Ok(42);
    }
}
