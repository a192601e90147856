//! Kubernetes API server client.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

use super::{build_http_client, BearerToken, ClusterApi};
use crate::config::selector::ParentPodFilter;
use crate::config::CheckpointerConfig;
use crate::error::ClusterError;
use crate::models::{ConfigMap, ParentPod, Pod, PodList, Secret};

/// Longest error body echoed into a [`ClusterError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Cap an error body at `MAX_ERROR_BODY` bytes without splitting a character.
fn truncate_body(mut body: String) -> String {
    let mut end = MAX_ERROR_BODY.min(body.len());
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
    body
}

pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
    token: BearerToken,
    node_name: String,
    namespace: Option<String>,
    filter: ParentPodFilter,
}

impl ClusterClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: BearerToken,
        node_name: impl Into<String>,
        namespace: Option<String>,
        filter: ParentPodFilter,
    ) -> Self {
        ClusterClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            node_name: node_name.into(),
            namespace,
            filter,
        }
    }

    pub fn from_config(config: &CheckpointerConfig) -> Result<Self, ClusterError> {
        let base_url = config
            .api
            .url
            .clone()
            .ok_or_else(|| ClusterError::Setup("api.url is not set".to_string()))?;
        let http = build_http_client(
            config.request_timeout(),
            config.api.ca_file.as_deref(),
            config.api.insecure_skip_verify,
        )
        .map_err(ClusterError::Setup)?;

        log::info!(
            "[Cluster] API server {} (node {}, namespace {})",
            base_url,
            config.node_name,
            config.namespace.as_deref().unwrap_or("<all>")
        );
        Ok(ClusterClient::new(
            http,
            base_url,
            BearerToken::from_file(config.api.token_file.as_deref()),
            config.node_name.clone(),
            config.namespace.clone(),
            config.parent_filter(),
        ))
    }

    fn pods_path(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("/api/v1/namespaces/{}/pods", ns),
            None => "/api/v1/pods".to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClusterError> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        let request = self
            .token
            .apply(request)
            .map_err(|e| ClusterError::Setup(format!("Failed to read API token: {}", e)))?;

        let response = request.send().await?;
        let status = response.status();
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ClusterError::Unauthorized(status.as_u16()))
            }
            StatusCode::NOT_FOUND => return Err(ClusterError::NotFound(path.to_string())),
            _ => {
                let message = truncate_body(response.text().await.unwrap_or_default());
                return Err(ClusterError::Status {
                    status: status.as_u16(),
                    message,
                });
            }
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClusterError::Decode(e.to_string()))
    }

    /// Re-apply node binding and marker rules; drop checkpoint-derived pods.
    fn is_candidate(&self, pod: &Pod) -> bool {
        let bound_here = pod
            .spec
            .get("nodeName")
            .and_then(|v| v.as_str())
            .map_or(false, |node| node == self.node_name);
        let in_scope = self
            .namespace
            .as_ref()
            .map_or(true, |ns| *ns == pod.metadata.namespace);

        bound_here
            && in_scope
            && pod.checkpoint_of().is_none()
            && self
                .filter
                .is_parent(&pod.metadata.labels, &pod.metadata.annotations)
    }
}

#[async_trait]
impl ClusterApi for ClusterClient {
    async fn list_checkpoint_candidates(&self) -> Result<Vec<ParentPod>, ClusterError> {
        let mut query = vec![("fieldSelector", format!("spec.nodeName={}", self.node_name))];
        if let Some(selector) = self.filter.eligibility.label_selector() {
            query.push(("labelSelector", selector));
        }

        let list: PodList = self.get_json(&self.pods_path(), &query).await?;
        let total = list.items.len();
        let mut parents: Vec<ParentPod> = list
            .items
            .into_iter()
            .filter(|pod| self.is_candidate(pod))
            .map(ParentPod::new)
            .collect();
        parents.sort_by(|a, b| a.identity.cmp(&b.identity));

        log::debug!(
            "[Cluster] {} of {} listed pods are checkpoint candidates",
            parents.len(),
            total
        );
        Ok(parents)
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError> {
        let secret: Secret = self
            .get_json(&format!("/api/v1/namespaces/{}/secrets/{}", namespace, name), &[])
            .await?;
        secret
            .data
            .into_iter()
            .map(|(key, encoded)| {
                BASE64
                    .decode(encoded.as_bytes())
                    .map(|bytes| (key.clone(), bytes))
                    .map_err(|e| {
                        ClusterError::Decode(format!(
                            "secret {}/{} key {}: {}",
                            namespace, name, key, e
                        ))
                    })
            })
            .collect()
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        let config_map: ConfigMap = self
            .get_json(
                &format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name),
                &[],
            )
            .await?;
        Ok(config_map.data)
    }
}
