//! Checkpointer configuration.
//!
//! Everything the controller needs is decided once at startup from a config
//! file plus a handful of environment overrides, then validated. Nothing here is
//! renegotiated at runtime.

pub mod loader;
pub mod selector;

use serde::{Deserialize, Serialize};
use std::path::{Component, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{CHECKPOINT_ANNOTATION, CHECKPOINT_OPT_OUT_ANNOTATION};
use selector::{MarkerRule, ParentPodFilter, Requirement};

pub const DEFAULT_SERVICE_ACCOUNT_TOKEN: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Cluster API server connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    /// Base URL; derived from `KUBERNETES_SERVICE_HOST`/`PORT` when unset.
    pub url: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        ApiServerConfig {
            url: None,
            token_file: Some(PathBuf::from(DEFAULT_SERVICE_ACCOUNT_TOKEN)),
            ca_file: Some(PathBuf::from(DEFAULT_SERVICE_ACCOUNT_CA)),
            insecure_skip_verify: false,
        }
    }
}

/// Local node agent (kubelet) endpoint selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Use the authenticated hostname endpoint instead of the loopback read-only one.
    pub use_secure_endpoint: bool,
    pub insecure_port: u16,
    pub secure_port: u16,
    /// Overrides the node hostname used for the secure endpoint.
    pub hostname: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Kubelet serving certificates are commonly self-signed.
    pub insecure_skip_verify: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            use_secure_endpoint: false,
            insecure_port: 10255,
            secure_port: 10250,
            hostname: None,
            token_file: Some(PathBuf::from(DEFAULT_SERVICE_ACCOUNT_TOKEN)),
            ca_file: None,
            insecure_skip_verify: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointerConfig {
    /// Name of the node this checkpointer runs on.
    pub node_name: String,
    /// Namespace to watch; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Root of the checkpoint store.
    pub checkpoint_dir: PathBuf,
    /// Static pod directory watched by the node agent.
    pub manifest_dir: PathBuf,
    pub reconcile_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub eligibility: MarkerRule,
    pub opt_out: Option<MarkerRule>,
    pub api: ApiServerConfig,
    pub agent: AgentConfig,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        CheckpointerConfig {
            node_name: String::new(),
            namespace: Some("kube-system".to_string()),
            checkpoint_dir: PathBuf::from("/etc/kubernetes/checkpoints"),
            manifest_dir: PathBuf::from("/etc/kubernetes/manifests"),
            reconcile_interval_secs: 3,
            request_timeout_secs: 5,
            eligibility: MarkerRule::annotation(Requirement::equals(CHECKPOINT_ANNOTATION, "true")),
            opt_out: Some(MarkerRule::annotation(Requirement::equals(
                CHECKPOINT_OPT_OUT_ANNOTATION,
                "true",
            ))),
            api: ApiServerConfig::default(),
            agent: AgentConfig::default(),
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl CheckpointerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn parent_filter(&self) -> ParentPodFilter {
        ParentPodFilter {
            eligibility: self.eligibility.clone(),
            opt_out: self.opt_out.clone(),
        }
    }

    /// Apply `NODE_NAME` and in-cluster API server discovery.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node) = lookup("NODE_NAME").filter(|v| !v.is_empty()) {
            self.node_name = node;
        }
        if self.api.url.is_none() {
            if let (Some(host), Some(port)) = (
                lookup("KUBERNETES_SERVICE_HOST"),
                lookup("KUBERNETES_SERVICE_PORT"),
            ) {
                let host = if host.contains(':') {
                    format!("[{}]", host)
                } else {
                    host
                };
                self.api.url = Some(format!("https://{}:{}", host, port));
            }
        }
        if let Some(level) = lookup("CHECKPOINTER_LOG").filter(|v| !v.is_empty()) {
            self.log_level = level;
        }
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info)
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "node_name must be set (config or NODE_NAME)".to_string(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "reconcile_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        for (name, dir) in [
            ("checkpoint_dir", &self.checkpoint_dir),
            ("manifest_dir", &self.manifest_dir),
        ] {
            if dir.components().any(|c| c == Component::ParentDir) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must not contain '..', got {}",
                    name,
                    dir.display()
                )));
            }
            if !dir.is_absolute() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    dir.display()
                )));
            }
        }
        // Path comparison is per component, so trailing separators do not matter.
        if self.checkpoint_dir.starts_with(&self.manifest_dir) {
            return Err(ConfigError::ValidationFailed(format!(
                "checkpoint_dir {} must not be the manifest_dir or lie inside it",
                self.checkpoint_dir.display()
            )));
        }
        if self.api.url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ValidationFailed(
                "api.url must be set (config or KUBERNETES_SERVICE_HOST/PORT)".to_string(),
            ));
        }
        self.eligibility.requirement.validate()?;
        if let Some(rule) = &self.opt_out {
            rule.requirement.validate()?;
        }
        Ok(())
    }
}
