//! On-disk checkpoint store.
//!
//! ```text
//! <checkpoint_dir>/manifests/<ns>_<name>.json
//! <checkpoint_dir>/secrets/<ns>/<name>/<secret>/<file>
//! <checkpoint_dir>/configmaps/<ns>/<name>/<configmap>/<file>
//! <checkpoint_dir>/projected/<ns>/<name>/<volume>/<file>
//! <manifest_dir>/checkpoint-<ns>_<name>.json      (active copies)
//! ```
//!
//! Every file is replaced by writing a temp file in the destination directory,
//! syncing it and renaming it into place. The node agent reads `manifest_dir`
//! concurrently and never observes a partially written manifest. Temp files left
//! behind by an interrupted write start with `.` and end in `.tmp`, so listings
//! skip them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::checkpoint::transform::{
    object_dir, CheckpointData, CheckpointManifest, ObjectFiles, CONFIGMAPS_SUBDIR, PROJECTED_SUBDIR,
    SECRETS_SUBDIR,
};
use crate::error::StoreError;
use crate::models::{PodIdentity, CHECKPOINTED_AT_ANNOTATION, FINGERPRINT_ANNOTATION};

const MANIFESTS_SUBDIR: &str = "manifests";
const ACTIVE_PREFIX: &str = "checkpoint-";
const MANIFEST_EXT: &str = "json";
const DATA_SUBDIRS: [&str; 3] = [SECRETS_SUBDIR, CONFIGMAPS_SUBDIR, PROJECTED_SUBDIR];

/// Replace `path` with `contents` via temp file + rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;

    tmp.write_all(contents).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;

    // Make the rename durable; best effort.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Relative paths of all regular files below `dir`.
fn files_below(dir: &Path) -> Result<BTreeSet<String>, StoreError> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeSet<String>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.insert(rel.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }
    let mut out = BTreeSet::new();
    walk(dir, dir, &mut out)?;
    Ok(out)
}

/// Identities encoded in `dir` as `<prefix><ns>_<name>.json`.
fn identities_in(dir: &Path, prefix: &str) -> Result<BTreeSet<PodIdentity>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut ids = BTreeSet::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.extension().map_or(true, |ext| ext != MANIFEST_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(id) = stem
            .strip_prefix(prefix)
            .and_then(PodIdentity::from_file_stem)
        {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Durable checkpoint storage plus activation into the node agent's manifest directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    manifests_dir: PathBuf,
    active_dir: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) a store rooted at `checkpoint_dir`.
    pub fn open(
        checkpoint_dir: impl Into<PathBuf>,
        agent_manifest_dir: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let root = checkpoint_dir.into();
        let manifests_dir = root.join(MANIFESTS_SUBDIR);
        let active_dir = agent_manifest_dir.into();

        let data_dirs = DATA_SUBDIRS.iter().map(|kind| root.join(kind));
        for dir in std::iter::once(manifests_dir.clone()).chain(data_dirs) {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
            fs::set_permissions(&dir, Permissions::from_mode(0o700))
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        fs::create_dir_all(&active_dir).map_err(|e| StoreError::io(&active_dir, e))?;

        Ok(CheckpointStore {
            root,
            manifests_dir,
            active_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, id: &PodIdentity) -> PathBuf {
        self.manifests_dir
            .join(format!("{}.{}", id.file_stem(), MANIFEST_EXT))
    }

    pub fn active_path(&self, id: &PodIdentity) -> PathBuf {
        self.active_dir
            .join(format!("{}{}.{}", ACTIVE_PREFIX, id.file_stem(), MANIFEST_EXT))
    }

    /// Identities currently checkpointed.
    pub fn list(&self) -> Result<BTreeSet<PodIdentity>, StoreError> {
        identities_in(&self.manifests_dir, "")
    }

    pub fn read(&self, id: &PodIdentity) -> Result<CheckpointManifest, StoreError> {
        let path = self.manifest_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let pod: Value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let annotation = |key: &str| {
            pod.pointer("/metadata/annotations")
                .and_then(|a| a.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let fingerprint = annotation(FINGERPRINT_ANNOTATION).ok_or_else(|| StoreError::Corrupt {
            path: path.clone(),
            reason: "missing fingerprint annotation".to_string(),
        })?;
        let written_at = annotation(CHECKPOINTED_AT_ANNOTATION)
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(CheckpointManifest {
            identity: id.clone(),
            pod,
            fingerprint,
            written_at,
        })
    }

    /// Fingerprint of the stored checkpoint; `None` when absent or unreadable.
    pub fn stored_fingerprint(&self, id: &PodIdentity) -> Result<Option<String>, StoreError> {
        match self.read(id) {
            Ok(manifest) => Ok(Some(manifest.fingerprint)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(StoreError::Corrupt { path, reason }) => {
                log::warn!(
                    "[Store] Corrupt checkpoint {} ({}), will be rewritten",
                    path.display(),
                    reason
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn write_objects(
        &self,
        kind: &str,
        id: &PodIdentity,
        objects: &ObjectFiles,
        mode: u32,
    ) -> Result<(), StoreError> {
        let pod_dir = self.root.join(kind).join(&id.namespace).join(&id.name);

        for (object, files) in objects {
            let dir = object_dir(&self.root, kind, id, object);
            for (rel, bytes) in files {
                write_atomic(&dir.join(rel), bytes, mode)?;
            }
            for stale in files_below(&dir)? {
                if !files.contains_key(&stale) {
                    remove_file_if_exists(&dir.join(&stale))?;
                }
            }
        }

        // Objects the pod no longer mounts.
        if let Ok(entries) = fs::read_dir(&pod_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !objects.contains_key(&name) {
                    remove_dir_if_exists(&entry.path())?;
                }
            }
        }
        if objects.is_empty() {
            remove_dir_if_exists(&pod_dir)?;
        }
        Ok(())
    }

    /// Persist data files, then the manifest. Returns the recorded write time.
    ///
    /// An already active checkpoint is refreshed in the agent directory too.
    pub fn write(
        &self,
        manifest: &CheckpointManifest,
        data: &CheckpointData,
    ) -> Result<DateTime<Utc>, StoreError> {
        let id = &manifest.identity;
        self.write_objects(SECRETS_SUBDIR, id, &data.secrets, 0o600)?;
        self.write_objects(CONFIGMAPS_SUBDIR, id, &data.config_maps, 0o644)?;
        // Projected volumes may carry Secret data.
        self.write_objects(PROJECTED_SUBDIR, id, &data.projected, 0o600)?;

        let written_at = Utc::now();
        let mut pod = manifest.pod.clone();
        if let Some(annotations) = pod
            .pointer_mut("/metadata/annotations")
            .and_then(Value::as_object_mut)
        {
            annotations.insert(
                FINGERPRINT_ANNOTATION.to_string(),
                Value::String(manifest.fingerprint.clone()),
            );
            annotations.insert(
                CHECKPOINTED_AT_ANNOTATION.to_string(),
                Value::String(written_at.to_rfc3339()),
            );
        }
        let bytes = serde_json::to_vec_pretty(&pod)?;
        write_atomic(&self.manifest_path(id), &bytes, 0o600)?;

        if self.active_path(id).exists() {
            write_atomic(&self.active_path(id), &bytes, 0o600)?;
        }
        Ok(written_at)
    }

    /// Remove a checkpoint, its data and any active copy. Absence is not an error.
    pub fn delete(&self, id: &PodIdentity) -> Result<bool, StoreError> {
        self.deactivate(id)?;
        let existed = remove_file_if_exists(&self.manifest_path(id))?;
        for kind in DATA_SUBDIRS {
            remove_dir_if_exists(&self.root.join(kind).join(&id.namespace).join(&id.name))?;
        }
        Ok(existed)
    }

    /// Identities whose checkpoint is currently handed to the node agent.
    pub fn list_active(&self) -> Result<BTreeSet<PodIdentity>, StoreError> {
        identities_in(&self.active_dir, ACTIVE_PREFIX)
    }

    /// Copy the stored manifest into the agent's manifest directory.
    pub fn activate(&self, id: &PodIdentity) -> Result<(), StoreError> {
        let source = self.manifest_path(id);
        let bytes = match fs::read(&source) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(StoreError::io(&source, e)),
        };
        write_atomic(&self.active_path(id), &bytes, 0o600)
    }

    /// Withdraw the active copy. Absence is not an error.
    pub fn deactivate(&self, id: &PodIdentity) -> Result<bool, StoreError> {
        remove_file_if_exists(&self.active_path(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> CheckpointStore {
        CheckpointStore::open(tmp.path().join("checkpoints"), tmp.path().join("manifests")).unwrap()
    }

    fn manifest(name: &str, fingerprint: &str) -> CheckpointManifest {
        CheckpointManifest {
            identity: PodIdentity::new("kube-system", name),
            pod: json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": name, "namespace": "kube-system", "annotations": {}},
                "spec": {"containers": []}
            }),
            fingerprint: fingerprint.to_string(),
            written_at: None,
        }
    }

    fn secret_data(files: &[(&str, &str)]) -> CheckpointData {
        let mut data = CheckpointData::default();
        data.secrets.insert(
            "tls".to_string(),
            files
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        );
        data
    }

    #[test]
    fn test_write_read_list() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let m = manifest("kube-apiserver", "abc");
        let written = store.write(&m, &CheckpointData::default()).unwrap();

        let read = store.read(&m.identity).unwrap();
        assert_eq!(read.fingerprint, "abc");
        assert_eq!(read.written_at.map(|t| t.timestamp()), Some(written.timestamp()));
        assert_eq!(store.list().unwrap(), [m.identity.clone()].into_iter().collect());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = PodIdentity::new("kube-system", "ghost");
        assert!(matches!(store.read(&id), Err(StoreError::NotFound(_))));
        assert_eq!(store.stored_fingerprint(&id).unwrap(), None);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let m = manifest("kube-scheduler", "f1");
        store.write(&m, &secret_data(&[("a", "1")])).unwrap();
        store.activate(&m.identity).unwrap();

        assert!(store.delete(&m.identity).unwrap());
        assert!(!store.delete(&m.identity).unwrap());
        assert!(store.list().unwrap().is_empty());
        assert!(store.list_active().unwrap().is_empty());
        assert!(!tmp
            .path()
            .join("checkpoints/secrets/kube-system/kube-scheduler")
            .exists());
    }

    #[test]
    fn test_secret_files_replaced_and_pruned() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let m = manifest("kube-apiserver", "f1");
        store.write(&m, &secret_data(&[("a", "1"), ("b", "2")])).unwrap();
        store.write(&m, &secret_data(&[("a", "3")])).unwrap();

        let dir = tmp.path().join("checkpoints/secrets/kube-system/kube-apiserver/tls");
        assert_eq!(fs::read_to_string(dir.join("a")).unwrap(), "3");
        assert!(!dir.join("b").exists());
        let mode = fs::metadata(dir.join("a")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        store.write(&m, &CheckpointData::default()).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_projected_files_written_private_and_deleted() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let m = manifest("kube-apiserver", "f1");
        let mut data = CheckpointData::default();
        data.projected.insert(
            "tls".to_string(),
            [("server.key".to_string(), b"K".to_vec())].into_iter().collect(),
        );
        store.write(&m, &data).unwrap();

        let file = tmp
            .path()
            .join("checkpoints/projected/kube-system/kube-apiserver/tls/server.key");
        assert_eq!(fs::read(&file).unwrap(), b"K".to_vec());
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        store.delete(&m.identity).unwrap();
        assert!(!tmp.path().join("checkpoints/projected/kube-system/kube-apiserver").exists());
    }

    #[test]
    fn test_activate_and_refresh() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let m = manifest("kube-apiserver", "f1");
        store.write(&m, &CheckpointData::default()).unwrap();
        store.activate(&m.identity).unwrap();

        let active = tmp.path().join("manifests/checkpoint-kube-system_kube-apiserver.json");
        assert!(active.exists());
        assert_eq!(store.list_active().unwrap().len(), 1);

        store.write(&manifest("kube-apiserver", "f2"), &CheckpointData::default()).unwrap();
        let refreshed: Value = serde_json::from_slice(&fs::read(&active).unwrap()).unwrap();
        assert_eq!(refreshed["metadata"]["annotations"][FINGERPRINT_ANNOTATION], json!("f2"));

        assert!(store.deactivate(&m.identity).unwrap());
        assert!(!store.deactivate(&m.identity).unwrap());
    }

    #[test]
    fn test_activate_missing_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = PodIdentity::new("kube-system", "ghost");
        assert!(matches!(store.activate(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_ignores_foreign_and_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.write(&manifest("kube-apiserver", "f1"), &CheckpointData::default()).unwrap();
        let dir = tmp.path().join("checkpoints/manifests");
        fs::write(dir.join(".kube-system_x.json.abc.tmp"), b"{\"partial").unwrap();
        fs::write(dir.join("README"), b"hi").unwrap();
        fs::write(tmp.path().join("manifests/etcd.yaml"), b"bootstrap").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_manifest_reads_as_rewrite_needed() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = PodIdentity::new("kube-system", "kube-apiserver");
        fs::write(store.manifest_path(&id), b"{\"truncated").unwrap();
        assert!(matches!(store.read(&id), Err(StoreError::Corrupt { .. })));
        assert_eq!(store.stored_fingerprint(&id).unwrap(), None);
    }

    #[test]
    fn test_interrupted_write_leaves_previous_manifest() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let m = manifest("kube-apiserver", "f1");
        store.write(&m, &CheckpointData::default()).unwrap();
        let before = fs::read(store.manifest_path(&m.identity)).unwrap();

        // A writer that dies before rename leaves only its temp file.
        {
            let mut partial = tempfile::Builder::new()
                .prefix(".kube-system_kube-apiserver.json.")
                .suffix(".tmp")
                .tempfile_in(tmp.path().join("checkpoints/manifests"))
                .unwrap();
            partial.write_all(b"{\"apiVersion\": \"v1\", \"kind\"").unwrap();
            let _ = partial.keep().unwrap();
        }

        assert_eq!(fs::read(store.manifest_path(&m.identity)).unwrap(), before);
        assert_eq!(store.read(&m.identity).unwrap().fingerprint, "f1");
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
