//! Node agent (kubelet) client.
//!
//! Two endpoints serve the same `/pods/` listing: the read-only port on
//! loopback (plain HTTP, no auth) and the authenticated port on the node
//! hostname (HTTPS, bearer token). Which one is used is fixed at startup.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::{build_http_client, BearerToken, LocalAgent};
use crate::config::selector::ParentPodFilter;
use crate::config::CheckpointerConfig;
use crate::error::AgentError;
use crate::models::{merge_local_pod, ActiveLocalPod, LocalPods, PodIdentity, PodList, PodPhase};
use crate::system::node_hostname;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEndpoint {
    Insecure,
    Secure,
}

pub struct AgentClient {
    http: reqwest::Client,
    pods_url: String,
    token: BearerToken,
    filter: ParentPodFilter,
    endpoint: AgentEndpoint,
}

impl AgentClient {
    /// `http://127.0.0.1:<port>/pods/`, unauthenticated.
    pub fn insecure(port: u16, filter: ParentPodFilter, timeout: Duration) -> Result<Self, AgentError> {
        let http = build_http_client(timeout, None, false).map_err(AgentError::Setup)?;
        Ok(AgentClient {
            http,
            pods_url: format!("http://127.0.0.1:{}/pods/", port),
            token: BearerToken::None,
            filter,
            endpoint: AgentEndpoint::Insecure,
        })
    }

    /// `https://<hostname>:<port>/pods/` with bearer token authentication.
    pub fn secure(
        hostname: &str,
        port: u16,
        token: BearerToken,
        ca_file: Option<&Path>,
        insecure_skip_verify: bool,
        filter: ParentPodFilter,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let http =
            build_http_client(timeout, ca_file, insecure_skip_verify).map_err(AgentError::Setup)?;
        Ok(AgentClient {
            http,
            pods_url: format!("https://{}:{}/pods/", hostname, port),
            token,
            filter,
            endpoint: AgentEndpoint::Secure,
        })
    }

    /// Client against an arbitrary base URL.
    pub fn with_base_url(
        base_url: &str,
        token: BearerToken,
        filter: ParentPodFilter,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let http = build_http_client(timeout, None, false).map_err(AgentError::Setup)?;
        let endpoint = if base_url.starts_with("https://") {
            AgentEndpoint::Secure
        } else {
            AgentEndpoint::Insecure
        };
        Ok(AgentClient {
            http,
            pods_url: format!("{}/pods/", base_url.trim_end_matches('/')),
            token,
            filter,
            endpoint,
        })
    }

    pub fn from_config(config: &CheckpointerConfig) -> Result<Self, AgentError> {
        let agent = &config.agent;
        let filter = config.parent_filter();
        let client = if agent.use_secure_endpoint {
            let hostname = match &agent.hostname {
                Some(host) => host.clone(),
                None => node_hostname().map_err(AgentError::Setup)?,
            };
            AgentClient::secure(
                &hostname,
                agent.secure_port,
                BearerToken::from_file(agent.token_file.as_deref()),
                agent.ca_file.as_deref(),
                agent.insecure_skip_verify,
                filter,
                config.request_timeout(),
            )?
        } else {
            AgentClient::insecure(agent.insecure_port, filter, config.request_timeout())?
        };
        log::info!("[Agent] Using {:?} endpoint {}", client.endpoint, client.pods_url);
        Ok(client)
    }

    pub fn endpoint(&self) -> AgentEndpoint {
        self.endpoint
    }

    pub fn pods_url(&self) -> &str {
        &self.pods_url
    }

    async fn fetch(&self) -> Result<PodList, AgentError> {
        let request = self
            .token
            .apply(self.http.get(&self.pods_url))
            .map_err(|e| AgentError::Setup(format!("Failed to read agent token: {}", e)))?;
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| AgentError::Decode(e.to_string()))
    }
}

/// Reduce an agent pod listing to active parent and checkpoint-derived pods.
pub fn active_pods(list: PodList, filter: &ParentPodFilter) -> LocalPods {
    let mut pods = LocalPods::new();
    for pod in list.items {
        let phase = pod.status.phase.unwrap_or(PodPhase::Unknown);
        if !phase.is_active() {
            continue;
        }
        let local = match pod.checkpoint_of() {
            Some(parent) => ActiveLocalPod {
                identity: PodIdentity::new(&pod.metadata.namespace, parent),
                phase,
                checkpoint_derived: true,
            },
            None if filter.is_parent(&pod.metadata.labels, &pod.metadata.annotations) => {
                ActiveLocalPod {
                    identity: pod.identity(),
                    phase,
                    checkpoint_derived: false,
                }
            }
            None => continue,
        };
        merge_local_pod(&mut pods, local);
    }
    pods
}

#[async_trait]
impl LocalAgent for AgentClient {
    async fn list_parent_pods(&self) -> LocalPods {
        match self.fetch().await {
            Ok(list) => active_pods(list, &self.filter),
            Err(e) => {
                log::warn!(
                    "[Agent] {} failed, assuming no local parent pods: {}",
                    self.pods_url,
                    e
                );
                LocalPods::new()
            }
        }
    }
}
