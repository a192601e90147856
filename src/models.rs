//! Core data types for the pod checkpointer.
//!
//! The pod types mirror the subset of the Kubernetes core/v1 wire format the
//! checkpointer reads. `spec` stays raw JSON so fields this crate does not model
//! survive the round trip into a checkpoint manifest untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Annotation placed on checkpoint manifests; its value is the parent pod name.
pub const CHECKPOINT_OF_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpoint-of";

/// Annotation holding the checkpoint content fingerprint (SHA-256 hex).
pub const FINGERPRINT_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpoint-fingerprint";

/// Annotation holding the RFC 3339 time the checkpoint was written.
pub const CHECKPOINTED_AT_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpointed-at";

/// Default eligibility annotation key.
pub const CHECKPOINT_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpoint";

/// Default opt-out annotation key.
pub const CHECKPOINT_OPT_OUT_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpoint-opt-out";

/// (namespace, name) pair joining cluster, agent and store views.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        PodIdentity {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// File stem used on disk: `namespace_name`.
    ///
    /// Kubernetes namespaces and pod names cannot contain `_`, so the first
    /// underscore always separates the two halves.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }

    /// Inverse of [`PodIdentity::file_stem`].
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let (namespace, name) = stem.split_once('_')?;
        if namespace.is_empty() || name.is_empty() || name.contains('_') {
            return None;
        }
        Some(PodIdentity::new(namespace, name))
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// Object metadata. Only fields the checkpointer reads are modeled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Pod lifecycle phase as reported by the API server or the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl PodPhase {
    /// Pending or Running: the pod occupies (or is about to occupy) the node.
    pub fn is_active(&self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PodPhase>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn identity(&self) -> PodIdentity {
        PodIdentity::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Name of the parent pod if this pod was started from a checkpoint.
    pub fn checkpoint_of(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(CHECKPOINT_OF_ANNOTATION)
            .map(String::as_str)
    }

    /// The owner reference flagged as controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .iter()
            .find(|r| r.controller == Some(true))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

/// Secret as returned by the API server; `data` values are base64.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A cluster-managed pod the controller is responsible for checkpointing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentPod {
    pub identity: PodIdentity,
    pub pod: Pod,
    pub owner: Option<OwnerReference>,
}

impl ParentPod {
    pub fn new(pod: Pod) -> Self {
        ParentPod {
            identity: pod.identity(),
            owner: pod.controller_ref().cloned(),
            pod,
        }
    }
}

/// A pod the node agent reports as occupying this node.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveLocalPod {
    /// Identity of the parent pod (for checkpoint-derived pods, the pod it was checkpointed from).
    pub identity: PodIdentity,
    pub phase: PodPhase,
    /// True when the agent runs this pod from a checkpoint manifest.
    pub checkpoint_derived: bool,
}

impl ActiveLocalPod {
    /// Running because the cluster scheduled it, not because of a checkpoint.
    pub fn is_live(&self) -> bool {
        !self.checkpoint_derived
    }
}

/// Agent view keyed by parent identity.
pub type LocalPods = HashMap<PodIdentity, ActiveLocalPod>;

/// Insert into the agent view, keeping a live record over a checkpoint-derived one.
pub fn merge_local_pod(pods: &mut LocalPods, pod: ActiveLocalPod) {
    match pods.get(&pod.identity) {
        Some(existing) if existing.is_live() && !pod.is_live() => {}
        _ => {
            pods.insert(pod.identity.clone(), pod);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_file_stem_roundtrip() {
        let id = PodIdentity::new("kube-system", "kube-apiserver-abc12");
        assert_eq!(id.file_stem(), "kube-system_kube-apiserver-abc12");
        assert_eq!(PodIdentity::from_file_stem(&id.file_stem()), Some(id));
    }

    #[test]
    fn test_identity_from_bad_stem() {
        assert_eq!(PodIdentity::from_file_stem("no-separator"), None);
        assert_eq!(PodIdentity::from_file_stem("_name"), None);
        assert_eq!(PodIdentity::from_file_stem("ns_"), None);
        assert_eq!(PodIdentity::from_file_stem("ns_a_b"), None);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(
            PodIdentity::new("kube-system", "scheduler").to_string(),
            "kube-system/scheduler"
        );
    }

    #[test]
    fn test_pod_deserialize_unknown_phase() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "a", "namespace": "b"},
            "status": {"phase": "Evicted"}
        }))
        .unwrap();
        assert_eq!(pod.status.phase, Some(PodPhase::Unknown));
        assert!(pod.spec.is_null());
    }

    #[test]
    fn test_controller_ref() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": "kube-apiserver-x",
                "namespace": "kube-system",
                "ownerReferences": [
                    {"apiVersion": "v1", "kind": "Node", "name": "n", "uid": "1"},
                    {"apiVersion": "apps/v1", "kind": "DaemonSet", "name": "kube-apiserver", "uid": "2", "controller": true}
                ]
            }
        }))
        .unwrap();
        let parent = ParentPod::new(pod);
        assert_eq!(parent.owner.unwrap().kind, "DaemonSet");
    }

    #[test]
    fn test_merge_prefers_live() {
        let id = PodIdentity::new("kube-system", "kube-apiserver");
        let mut pods = LocalPods::new();
        merge_local_pod(
            &mut pods,
            ActiveLocalPod {
                identity: id.clone(),
                phase: PodPhase::Running,
                checkpoint_derived: false,
            },
        );
        merge_local_pod(
            &mut pods,
            ActiveLocalPod {
                identity: id.clone(),
                phase: PodPhase::Running,
                checkpoint_derived: true,
            },
        );
        assert!(pods[&id].is_live());

        let mut pods = LocalPods::new();
        merge_local_pod(
            &mut pods,
            ActiveLocalPod {
                identity: id.clone(),
                phase: PodPhase::Running,
                checkpoint_derived: true,
            },
        );
        merge_local_pod(
            &mut pods,
            ActiveLocalPod {
                identity: id.clone(),
                phase: PodPhase::Pending,
                checkpoint_derived: false,
            },
        );
        assert!(pods[&id].is_live());
    }
}
