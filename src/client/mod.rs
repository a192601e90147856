//! Cluster API and node agent clients.
//!
//! The controller only sees the [`ClusterApi`] and [`LocalAgent`] traits, so
//! tests run it against in-memory fakes.

pub mod agent;
pub mod cluster;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ClusterError;
use crate::models::{LocalPods, ParentPod};

pub use agent::AgentClient;
pub use cluster::ClusterClient;

/// Authoritative view of desired pods, queried each tick.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Checkpoint-eligible pods bound to this node, sorted by identity.
    async fn list_checkpoint_candidates(&self) -> Result<Vec<ParentPod>, ClusterError>;

    /// Secret data, base64-decoded.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError>;
}

/// Node-local view of running pods. Never fails: errors read as "nothing running".
#[async_trait]
pub trait LocalAgent: Send + Sync {
    async fn list_parent_pods(&self) -> LocalPods;
}

/// Where a bearer token comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerToken {
    None,
    Static(String),
    /// Re-read on every request; projected service account tokens rotate.
    File(PathBuf),
}

impl BearerToken {
    pub fn from_file(path: Option<&Path>) -> Self {
        match path {
            Some(p) => BearerToken::File(p.to_path_buf()),
            None => BearerToken::None,
        }
    }

    pub fn resolve(&self) -> io::Result<Option<String>> {
        match self {
            BearerToken::None => Ok(None),
            BearerToken::Static(token) => Ok(Some(token.clone())),
            BearerToken::File(path) => {
                let token = std::fs::read_to_string(path)?;
                Ok(Some(token.trim().to_string()).filter(|t| !t.is_empty()))
            }
        }
    }

    /// Attach the token, if any, to `request`.
    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> io::Result<reqwest::RequestBuilder> {
        Ok(match self.resolve()? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}

/// Shared reqwest client construction.
pub(crate) fn build_http_client(
    timeout: Duration,
    ca_file: Option<&Path>,
    insecure_skip_verify: bool,
) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .danger_accept_invalid_certs(insecure_skip_verify);

    if let Some(path) = ca_file {
        let pem = std::fs::read(path)
            .map_err(|e| format!("Failed to read CA bundle {}: {}", path.display(), e))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| format!("Invalid CA bundle {}: {}", path.display(), e))?;
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_token_file_is_trimmed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("token");
        std::fs::write(&path, "abc.def\n").unwrap();
        let token = BearerToken::from_file(Some(&path));
        assert_eq!(token.resolve().unwrap().as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_empty_or_missing_token() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("token");
        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(BearerToken::File(path).resolve().unwrap(), None);
        assert!(BearerToken::File(tmp.path().join("missing")).resolve().is_err());
        assert_eq!(BearerToken::from_file(None), BearerToken::None);
    }

    #[test]
    fn test_build_client_rejects_missing_ca() {
        let err = build_http_client(
            Duration::from_secs(1),
            Some(Path::new("/nonexistent/ca.crt")),
            false,
        )
        .unwrap_err();
        assert!(err.contains("CA bundle"));
        assert!(build_http_client(Duration::from_secs(1), None, true).is_ok());
    }
}
