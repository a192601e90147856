//! Unified error type hierarchy for the pod checkpointer
//!
//! Provides structured error handling with ConfigError, ClusterError, AgentError,
//! StoreError, TransformError and WaitError.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Cluster API server errors.
///
/// Anything but `NotFound` means the API server could not give an answer this
/// tick, which is distinct from an answer with zero pods.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("API server unreachable: {0}")]
    Transport(String),

    #[error("API server rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("API server returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode API server response: {0}")]
    Decode(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("API request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to construct API client: {0}")]
    Setup(String),
}

impl ClusterError {
    /// True when the error says nothing about the object and only about reachability.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, ClusterError::NotFound(_))
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClusterError::Decode(e.to_string())
        } else {
            ClusterError::Transport(e.to_string())
        }
    }
}

/// Local node agent (kubelet) errors.
///
/// These never reach the controller: the agent client absorbs them and reports
/// an empty pod set.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Node agent unreachable: {0}")]
    Transport(String),

    #[error("Node agent returned HTTP {0}")]
    Status(u16),

    #[error("Failed to decode node agent response: {0}")]
    Decode(String),

    #[error("Failed to construct node agent client: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AgentError::Decode(e.to_string())
        } else {
            AgentError::Transport(e.to_string())
        }
    }
}

/// Checkpoint store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Manifest transformation errors.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Pod {pod} references missing {kind} {name}")]
    UnresolvedReference {
        pod: String,
        kind: &'static str,
        name: String,
    },

    #[error("Pod {pod} references missing key {key} in {kind} {name}")]
    MissingKey {
        pod: String,
        kind: &'static str,
        name: String,
        key: String,
    },

    #[error("Pod {0} has a malformed spec: {1}")]
    MalformedSpec(String, String),

    #[error("Pod {pod} volume {volume} cannot be checkpointed: {reason}")]
    UnsupportedVolume {
        pod: String,
        volume: String,
        reason: String,
    },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure to checkpoint a single parent pod. Isolated to that pod's tick work.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Polling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("Condition not met within {0:?}")]
    Timeout(std::time::Duration),
}

/// Top-level result type for operations that may fail.
/// Use this as the return type for process-level setup in `main`.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
