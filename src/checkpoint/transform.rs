//! Parent pod → checkpoint manifest conversion.
//!
//! A checkpoint must start on the node agent with no help from the API
//! server: no service account token, no scheduler-assigned node, no live
//! Secret or ConfigMap lookups. Secret and ConfigMap volumes are rewritten to
//! `hostPath` volumes over checkpointed copies of their data, and env references
//! are inlined as literal values.
//!
//! The output is a pure function of the pod spec and the resolved data, so
//! API-server churn (resourceVersion, status, timestamps) never changes the
//! fingerprint.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use crate::config::selector::{MarkerSource, ParentPodFilter};
use crate::error::TransformError;
use crate::models::{ParentPod, PodIdentity, CHECKPOINT_OF_ANNOTATION, FINGERPRINT_ANNOTATION};

/// Spec fields only the control plane can fill in.
const STRIPPED_SPEC_FIELDS: &[&str] = &["nodeName", "serviceAccountName", "serviceAccount", "priority"];

pub(crate) const SECRETS_SUBDIR: &str = "secrets";
pub(crate) const CONFIGMAPS_SUBDIR: &str = "configmaps";
pub(crate) const PROJECTED_SUBDIR: &str = "projected";

/// Where the node agent mounts a pod's service account credentials.
const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Files keyed by object name, then by path relative to the object's directory.
pub type ObjectFiles = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Secret and ConfigMap data the controller fetched for one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRefs {
    pub secrets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    pub config_maps: BTreeMap<String, BTreeMap<String, String>>,
}

/// Objects a pod spec references. The flag is true when every reference is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pub secrets: BTreeMap<String, bool>,
    pub config_maps: BTreeMap<String, bool>,
}

impl References {
    fn note(map: &mut BTreeMap<String, bool>, name: &str, optional: bool) {
        map.entry(name.to_string())
            .and_modify(|all_optional| *all_optional &= optional)
            .or_insert(optional);
    }
}

/// Files mounted into the checkpoint through `hostPath` volumes.
///
/// `projected` is keyed by volume name: one directory merges every source of
/// that volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointData {
    pub secrets: ObjectFiles,
    pub config_maps: ObjectFiles,
    pub projected: ObjectFiles,
}

/// Inert static pod manifest plus its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointManifest {
    pub identity: PodIdentity,
    pub pod: Value,
    pub fingerprint: String,
    pub written_at: Option<DateTime<Utc>>,
}

/// Where checkpointed data lives and which marker keys to strip.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub checkpoint_dir: PathBuf,
    pub stripped_labels: Vec<String>,
    pub stripped_annotations: Vec<String>,
}

impl TransformOptions {
    pub fn new(checkpoint_dir: impl Into<PathBuf>, filter: &ParentPodFilter) -> Self {
        let mut stripped_labels = Vec::new();
        let mut stripped_annotations = Vec::new();
        let rules = std::iter::once(&filter.eligibility).chain(filter.opt_out.iter());
        for rule in rules {
            match rule.source {
                MarkerSource::Label => stripped_labels.push(rule.requirement.key.clone()),
                MarkerSource::Annotation => stripped_annotations.push(rule.requirement.key.clone()),
            }
        }
        TransformOptions {
            checkpoint_dir: checkpoint_dir.into(),
            stripped_labels,
            stripped_annotations,
        }
    }

    pub fn secret_dir(&self, id: &PodIdentity, secret: &str) -> PathBuf {
        object_dir(&self.checkpoint_dir, SECRETS_SUBDIR, id, secret)
    }

    pub fn config_map_dir(&self, id: &PodIdentity, config_map: &str) -> PathBuf {
        object_dir(&self.checkpoint_dir, CONFIGMAPS_SUBDIR, id, config_map)
    }

    pub fn projected_dir(&self, id: &PodIdentity, volume: &str) -> PathBuf {
        object_dir(&self.checkpoint_dir, PROJECTED_SUBDIR, id, volume)
    }
}

pub(crate) fn object_dir(root: &Path, kind: &str, id: &PodIdentity, object: &str) -> PathBuf {
    root.join(kind).join(&id.namespace).join(&id.name).join(object)
}

/// Names of service account token volumes. They are injected by admission and
/// useless offline: admission-generated `kube-api-access-*` volumes, projected
/// `serviceAccountToken` sources, and anything mounted at the service account path.
fn service_account_volumes(spec: &Value) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = containers(spec)
        .filter_map(|c| c.get("volumeMounts").and_then(Value::as_array))
        .flatten()
        .filter(|m| {
            m.get("mountPath")
                .and_then(Value::as_str)
                .map_or(false, |p| p.trim_end_matches('/') == SERVICE_ACCOUNT_MOUNT_PATH)
        })
        .filter_map(|m| m.get("name").and_then(Value::as_str).map(str::to_string))
        .collect();

    for volume in spec.get("volumes").and_then(Value::as_array).into_iter().flatten() {
        let name = volume.get("name").and_then(Value::as_str).unwrap_or("");
        let token_source = volume
            .pointer("/projected/sources")
            .and_then(Value::as_array)
            .map_or(false, |sources| {
                sources.iter().any(|s| s.get("serviceAccountToken").is_some())
            });
        if name.starts_with("kube-api-access-") || token_source {
            names.insert(name.to_string());
        }
    }
    names
}

fn containers_mut(spec: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    spec.iter_mut()
        .filter(|(k, _)| k.as_str() == "containers" || k.as_str() == "initContainers")
        .filter_map(|(_, v)| v.as_array_mut())
        .flat_map(|list| list.iter_mut())
        .filter_map(Value::as_object_mut)
}

fn containers(spec: &Value) -> impl Iterator<Item = &Value> {
    ["containers", "initContainers"]
        .into_iter()
        .filter_map(move |k| spec.get(k).and_then(Value::as_array))
        .flatten()
}

fn optional_flag(v: &Value) -> bool {
    v.get("optional").and_then(Value::as_bool).unwrap_or(false)
}

/// Secrets and ConfigMaps the controller must fetch before transforming `pod`.
pub fn referenced_objects(parent: &ParentPod) -> References {
    let mut refs = References::default();
    let spec = &parent.pod.spec;
    let tokens = service_account_volumes(spec);

    for volume in spec.get("volumes").and_then(Value::as_array).into_iter().flatten() {
        let name = volume.get("name").and_then(Value::as_str).unwrap_or("");
        if tokens.contains(name) {
            continue;
        }
        for source in volume
            .pointer("/projected/sources")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(r) = source.get("secret") {
                if let Some(name) = r.get("name").and_then(Value::as_str) {
                    References::note(&mut refs.secrets, name, optional_flag(r));
                }
            }
            if let Some(r) = source.get("configMap") {
                if let Some(name) = r.get("name").and_then(Value::as_str) {
                    References::note(&mut refs.config_maps, name, optional_flag(r));
                }
            }
        }
        if let Some(secret) = volume.get("secret") {
            if let Some(name) = secret.get("secretName").and_then(Value::as_str) {
                References::note(&mut refs.secrets, name, optional_flag(secret));
            }
        }
        if let Some(cm) = volume.get("configMap") {
            if let Some(name) = cm.get("name").and_then(Value::as_str) {
                References::note(&mut refs.config_maps, name, optional_flag(cm));
            }
        }
    }

    for container in containers(spec) {
        for env in container.get("env").and_then(Value::as_array).into_iter().flatten() {
            if let Some(r) = env.pointer("/valueFrom/secretKeyRef") {
                if let Some(name) = r.get("name").and_then(Value::as_str) {
                    References::note(&mut refs.secrets, name, optional_flag(r));
                }
            }
            if let Some(r) = env.pointer("/valueFrom/configMapKeyRef") {
                if let Some(name) = r.get("name").and_then(Value::as_str) {
                    References::note(&mut refs.config_maps, name, optional_flag(r));
                }
            }
        }
        for source in container.get("envFrom").and_then(Value::as_array).into_iter().flatten() {
            if let Some(r) = source.get("secretRef") {
                if let Some(name) = r.get("name").and_then(Value::as_str) {
                    References::note(&mut refs.secrets, name, optional_flag(r));
                }
            }
            if let Some(r) = source.get("configMapRef") {
                if let Some(name) = r.get("name").and_then(Value::as_str) {
                    References::note(&mut refs.config_maps, name, optional_flag(r));
                }
            }
        }
    }

    refs
}

/// Reject item paths that would escape the object directory.
fn safe_relative_path(pod: &PodIdentity, path: &str) -> Result<String, TransformError> {
    let p = Path::new(path);
    let ok = !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path.to_string())
    } else {
        Err(TransformError::MalformedSpec(
            pod.to_string(),
            format!("volume item path {:?} is not a plain relative path", path),
        ))
    }
}

/// Project `data` through an optional `items` list into files.
fn project_files(
    pod: &PodIdentity,
    kind: &'static str,
    object: &str,
    source: &Value,
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<BTreeMap<String, Vec<u8>>, TransformError> {
    let Some(items) = source.get("items").and_then(Value::as_array) else {
        return Ok(data.clone());
    };
    let mut files = BTreeMap::new();
    for item in items {
        let key = item.get("key").and_then(Value::as_str).unwrap_or("");
        let path = item.get("path").and_then(Value::as_str).unwrap_or(key);
        match data.get(key) {
            Some(bytes) => {
                files.insert(safe_relative_path(pod, path)?, bytes.clone());
            }
            None if optional_flag(source) => {}
            None => {
                return Err(TransformError::MissingKey {
                    pod: pod.to_string(),
                    kind,
                    name: object.to_string(),
                    key: key.to_string(),
                })
            }
        }
    }
    Ok(files)
}

fn host_path_volume(name: &str, dir: &Path) -> Value {
    json!({
        "name": name,
        "hostPath": { "path": dir.to_string_lossy() }
    })
}

fn empty_dir_volume(name: &str) -> Value {
    json!({ "name": name, "emptyDir": {} })
}

fn config_map_bytes(values: &BTreeMap<String, String>) -> BTreeMap<String, Vec<u8>> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
        .collect()
}

/// Merge the Secret and ConfigMap sources of a projected volume into one file set.
///
/// `None` means the volume has no such sources and needs no rewrite.
fn project_sources(
    id: &PodIdentity,
    volume: &str,
    sources: &[Value],
    refs: &ResolvedRefs,
) -> Result<Option<BTreeMap<String, Vec<u8>>>, TransformError> {
    let has_object_source = sources
        .iter()
        .any(|s| s.get("secret").is_some() || s.get("configMap").is_some());
    if !has_object_source {
        return Ok(None);
    }

    let mut files = BTreeMap::new();
    for source in sources {
        let projected = if let Some(r) = source.get("secret") {
            let name = r.get("name").and_then(Value::as_str).unwrap_or("");
            match refs.secrets.get(name) {
                Some(values) => Some(project_files(id, "Secret", name, r, values)?),
                None if optional_flag(r) => None,
                None => {
                    return Err(TransformError::UnresolvedReference {
                        pod: id.to_string(),
                        kind: "Secret",
                        name: name.to_string(),
                    })
                }
            }
        } else if let Some(r) = source.get("configMap") {
            let name = r.get("name").and_then(Value::as_str).unwrap_or("");
            match refs.config_maps.get(name) {
                Some(values) => Some(project_files(id, "ConfigMap", name, r, &config_map_bytes(values))?),
                None if optional_flag(r) => None,
                None => {
                    return Err(TransformError::UnresolvedReference {
                        pod: id.to_string(),
                        kind: "ConfigMap",
                        name: name.to_string(),
                    })
                }
            }
        } else {
            // downwardAPI and friends have no file form on the host.
            let kind = source
                .as_object()
                .and_then(|o| o.keys().next().cloned())
                .unwrap_or_default();
            return Err(TransformError::UnsupportedVolume {
                pod: id.to_string(),
                volume: volume.to_string(),
                reason: format!("projected {} source mixed with Secret/ConfigMap sources", kind),
            });
        };
        files.extend(projected.into_iter().flatten());
    }
    Ok(Some(files))
}

fn rewrite_volumes(
    parent: &ParentPod,
    spec: &mut Map<String, Value>,
    refs: &ResolvedRefs,
    opts: &TransformOptions,
    data: &mut CheckpointData,
) -> Result<BTreeSet<String>, TransformError> {
    let id = &parent.identity;
    let mut dropped = BTreeSet::new();
    let Some(volumes) = spec.remove("volumes") else {
        return Ok(dropped);
    };
    let Value::Array(volumes) = volumes else {
        return Err(TransformError::MalformedSpec(
            id.to_string(),
            "spec.volumes is not a list".to_string(),
        ));
    };

    let tokens = service_account_volumes(&parent.pod.spec);
    let mut rewritten = Vec::with_capacity(volumes.len());
    for volume in volumes {
        let name = volume.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        if tokens.contains(&name) {
            dropped.insert(name);
            continue;
        }

        if let Some(sources) = volume.pointer("/projected/sources").and_then(Value::as_array) {
            if let Some(files) = project_sources(id, &name, sources, refs)? {
                data.projected.insert(name.clone(), files);
                rewritten.push(host_path_volume(&name, &opts.projected_dir(id, &name)));
                continue;
            }
        }

        if let Some(source) = volume.get("secret") {
            let secret = source.get("secretName").and_then(Value::as_str).unwrap_or("");
            match refs.secrets.get(secret) {
                Some(values) => {
                    let files = project_files(id, "Secret", secret, source, values)?;
                    data.secrets.insert(secret.to_string(), files);
                    rewritten.push(host_path_volume(&name, &opts.secret_dir(id, secret)));
                }
                None if optional_flag(source) => rewritten.push(empty_dir_volume(&name)),
                None => {
                    return Err(TransformError::UnresolvedReference {
                        pod: id.to_string(),
                        kind: "Secret",
                        name: secret.to_string(),
                    })
                }
            }
            continue;
        }

        if let Some(source) = volume.get("configMap") {
            let cm = source.get("name").and_then(Value::as_str).unwrap_or("");
            match refs.config_maps.get(cm) {
                Some(values) => {
                    let files = project_files(id, "ConfigMap", cm, source, &config_map_bytes(values))?;
                    data.config_maps.insert(cm.to_string(), files);
                    rewritten.push(host_path_volume(&name, &opts.config_map_dir(id, cm)));
                }
                None if optional_flag(source) => rewritten.push(empty_dir_volume(&name)),
                None => {
                    return Err(TransformError::UnresolvedReference {
                        pod: id.to_string(),
                        kind: "ConfigMap",
                        name: cm.to_string(),
                    })
                }
            }
            continue;
        }

        rewritten.push(volume);
    }

    spec.insert("volumes".to_string(), Value::Array(rewritten));
    Ok(dropped)
}

/// Literal value for a `secretKeyRef`/`configMapKeyRef`, `None` for a missing optional ref.
fn resolve_key_ref(
    pod: &PodIdentity,
    kind: &'static str,
    reference: &Value,
    refs: &ResolvedRefs,
) -> Result<Option<String>, TransformError> {
    let name = reference.get("name").and_then(Value::as_str).unwrap_or("");
    let key = reference.get("key").and_then(Value::as_str).unwrap_or("");
    let value = match kind {
        "Secret" => refs
            .secrets
            .get(name)
            .map(|data| data.get(key).map(|b| String::from_utf8_lossy(b).into_owned())),
        _ => refs.config_maps.get(name).map(|data| data.get(key).cloned()),
    };
    match value {
        Some(Some(v)) => Ok(Some(v)),
        _ if optional_flag(reference) => Ok(None),
        None => Err(TransformError::UnresolvedReference {
            pod: pod.to_string(),
            kind,
            name: name.to_string(),
        }),
        Some(None) => Err(TransformError::MissingKey {
            pod: pod.to_string(),
            kind,
            name: name.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Expand `envFrom` sources into literal env entries.
fn expand_env_from(
    pod: &PodIdentity,
    sources: &[Value],
    refs: &ResolvedRefs,
) -> Result<Vec<(String, String)>, TransformError> {
    let mut expanded: BTreeMap<String, String> = BTreeMap::new();
    // Later sources win on duplicate keys.
    for source in sources {
        let prefix = source.get("prefix").and_then(Value::as_str).unwrap_or("");
        let (kind, reference) = if let Some(r) = source.get("secretRef") {
            ("Secret", r)
        } else if let Some(r) = source.get("configMapRef") {
            ("ConfigMap", r)
        } else {
            continue;
        };
        let name = reference.get("name").and_then(Value::as_str).unwrap_or("");
        let entries: Option<Vec<(String, String)>> = match kind {
            "Secret" => refs.secrets.get(name).map(|data| {
                data.iter()
                    .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                    .collect()
            }),
            _ => refs
                .config_maps
                .get(name)
                .map(|data| data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        };
        match entries {
            Some(entries) => {
                for (k, v) in entries {
                    expanded.insert(format!("{}{}", prefix, k), v);
                }
            }
            None if optional_flag(reference) => {}
            None => {
                return Err(TransformError::UnresolvedReference {
                    pod: pod.to_string(),
                    kind,
                    name: name.to_string(),
                })
            }
        }
    }
    Ok(expanded.into_iter().collect())
}

fn rewrite_containers(
    id: &PodIdentity,
    spec: &mut Map<String, Value>,
    dropped_volumes: &BTreeSet<String>,
    refs: &ResolvedRefs,
) -> Result<(), TransformError> {
    for container in containers_mut(spec) {
        if let Some(Value::Array(mounts)) = container.get_mut("volumeMounts") {
            mounts.retain(|m| {
                let name = m.get("name").and_then(Value::as_str).unwrap_or("");
                !dropped_volumes.contains(name)
            });
        }

        let explicit: Vec<Value> = match container.remove("env") {
            Some(Value::Array(list)) => list,
            _ => Vec::new(),
        };
        let from = match container.remove("envFrom") {
            Some(Value::Array(list)) => expand_env_from(id, &list, refs)?,
            _ => Vec::new(),
        };

        let explicit_names: BTreeSet<String> = explicit
            .iter()
            .filter_map(|e| e.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();

        // Explicit env takes precedence over envFrom.
        let mut env: Vec<Value> = from
            .into_iter()
            .filter(|(name, _)| !explicit_names.contains(name))
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        for entry in explicit {
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let literal = if let Some(r) = entry.pointer("/valueFrom/secretKeyRef") {
                Some(resolve_key_ref(id, "Secret", r, refs)?)
            } else if let Some(r) = entry.pointer("/valueFrom/configMapKeyRef") {
                Some(resolve_key_ref(id, "ConfigMap", r, refs)?)
            } else {
                None
            };
            match literal {
                Some(Some(value)) => env.push(json!({ "name": name, "value": value })),
                Some(None) => {}
                None => env.push(entry),
            }
        }

        if !env.is_empty() {
            container.insert("env".to_string(), Value::Array(env));
        }
    }
    Ok(())
}

fn sanitized_metadata(parent: &ParentPod, opts: &TransformOptions) -> Value {
    let meta = &parent.pod.metadata;
    let labels: Map<String, Value> = meta
        .labels
        .iter()
        .filter(|(k, _)| !opts.stripped_labels.contains(*k))
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut annotations: Map<String, Value> = meta
        .annotations
        .iter()
        .filter(|(k, _)| !opts.stripped_annotations.contains(*k))
        .filter(|(k, _)| k.as_str() != FINGERPRINT_ANNOTATION)
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    annotations.insert(
        CHECKPOINT_OF_ANNOTATION.to_string(),
        Value::String(parent.identity.name.clone()),
    );

    let mut out = Map::new();
    out.insert("name".into(), Value::String(parent.identity.name.clone()));
    out.insert(
        "namespace".into(),
        Value::String(parent.identity.namespace.clone()),
    );
    if !labels.is_empty() {
        out.insert("labels".into(), Value::Object(labels));
    }
    out.insert("annotations".into(), Value::Object(annotations));
    Value::Object(out)
}

/// Recursively sort object keys so serialization is independent of map ordering.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the canonical manifest followed by every checkpointed file.
pub fn fingerprint(pod: &Value, data: &CheckpointData) -> Result<String, TransformError> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&canonicalize(pod))?);
    for (kind, objects) in [
        ("secret", &data.secrets),
        ("configmap", &data.config_maps),
        ("projected", &data.projected),
    ] {
        for (object, files) in objects {
            for (path, bytes) in files {
                hasher.update(kind.as_bytes());
                hasher.update([0]);
                hasher.update(object.as_bytes());
                hasher.update([0]);
                hasher.update(path.as_bytes());
                hasher.update([0]);
                hasher.update((bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Convert a live parent pod into a self-sufficient checkpoint.
pub fn to_checkpoint(
    parent: &ParentPod,
    refs: &ResolvedRefs,
    opts: &TransformOptions,
) -> Result<(CheckpointManifest, CheckpointData), TransformError> {
    let id = &parent.identity;
    let mut spec = match &parent.pod.spec {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(TransformError::MalformedSpec(
                id.to_string(),
                "spec is not an object".to_string(),
            ))
        }
    };

    for field in STRIPPED_SPEC_FIELDS {
        spec.remove(*field);
    }
    spec.insert("automountServiceAccountToken".into(), Value::Bool(false));

    let mut data = CheckpointData::default();
    let dropped = rewrite_volumes(parent, &mut spec, refs, opts, &mut data)?;
    rewrite_containers(id, &mut spec, &dropped, refs)?;

    let mut pod = canonicalize(&json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": sanitized_metadata(parent, opts),
        "spec": Value::Object(spec),
    }));

    let fingerprint = fingerprint(&pod, &data)?;
    if let Some(annotations) = pod
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    {
        annotations.insert(
            FINGERPRINT_ANNOTATION.to_string(),
            Value::String(fingerprint.clone()),
        );
    }

    Ok((
        CheckpointManifest {
            identity: id.clone(),
            pod,
            fingerprint,
            written_at: None,
        },
        data,
    ))
}
