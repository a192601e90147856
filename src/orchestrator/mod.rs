//! Checkpoint controller: the periodic reconciliation loop.
//!
//! Each tick reads the cluster and the node agent concurrently, then takes one
//! of two branches:
//!
//! - **synced** (cluster answered): write checkpoints for parents that run live
//!   on this node, garbage-collect checkpoints absent from both views, and
//!   withdraw active copies that are no longer needed.
//! - **degraded** (cluster failed or timed out): never write or delete; hand
//!   stored checkpoints for pods that are not running live to the node agent.
//!
//! Nothing escapes a tick. Per-pod failures are counted and the next tick
//! retries from fresh observations.

pub mod executor;
pub mod state;

use chrono::Utc;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

pub use executor::{LocalState, WriteAction};
pub use state::{SyncStatus, TickMode, TickOutcome};

use crate::checkpoint::{referenced_objects, to_checkpoint, CheckpointStore, ResolvedRefs, TransformOptions};
use crate::client::{ClusterApi, LocalAgent};
use crate::config::CheckpointerConfig;
use crate::error::{ClusterError, ReconcileError};
use crate::log_event;
use crate::models::{LocalPods, ParentPod};

pub struct CheckpointController {
    cluster: Arc<dyn ClusterApi>,
    agent: Arc<dyn LocalAgent>,
    store: CheckpointStore,
    transform: TransformOptions,
    interval: Duration,
    request_timeout: Duration,
    status_tx: watch::Sender<SyncStatus>,
}

impl CheckpointController {
    pub fn new(
        config: &CheckpointerConfig,
        cluster: Arc<dyn ClusterApi>,
        agent: Arc<dyn LocalAgent>,
        store: CheckpointStore,
    ) -> Self {
        let transform = TransformOptions::new(store.root(), &config.parent_filter());
        let (status_tx, _) = watch::channel(SyncStatus::default());
        CheckpointController {
            cluster,
            agent,
            store,
            transform,
            interval: config.reconcile_interval(),
            request_timeout: config.request_timeout(),
            status_tx,
        }
    }

    /// Receiver updated after every tick.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Tick every `interval` until `shutdown` turns true or its sender is dropped.
    ///
    /// A tick that has started always runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log_event!(
            "[Controller] Started (interval {:?}, request timeout {:?})",
            self.interval,
            self.request_timeout
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        log_event!("[Controller] Stopped after {} ticks", self.status_tx.borrow().ticks);
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> TickOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let (local, parents) = tokio::join!(
            self.observe_agent(),
            self.bounded(self.cluster.list_checkpoint_candidates())
        );

        let mut outcome = match parents {
            Ok(parents) => self.sync(&parents, &local, TickOutcome::new(TickMode::Synced, started_at)).await,
            Err(e) => {
                log::warn!("[Controller] Cluster API unavailable, degraded tick: {}", e);
                self.degrade(&local, TickOutcome::new(TickMode::Degraded, started_at))
            }
        };
        outcome.duration = clock.elapsed();

        self.status_tx.send_modify(|status| status.record(outcome.clone()));
        let ticks = self.status_tx.borrow().ticks;
        log_event!("[Controller] tick {} {}", ticks, outcome);
        outcome
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, ClusterError>>,
    {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| ClusterError::Timeout(self.request_timeout))?
    }

    async fn observe_agent(&self) -> LocalPods {
        match tokio::time::timeout(self.request_timeout, self.agent.list_parent_pods()).await {
            Ok(pods) => pods,
            Err(_) => {
                log::warn!(
                    "[Controller] Node agent timed out after {:?}, assuming no local parent pods",
                    self.request_timeout
                );
                LocalPods::new()
            }
        }
    }

    async fn sync(&self, parents: &[ParentPod], local: &LocalPods, mut outcome: TickOutcome) -> TickOutcome {
        for parent in parents {
            match executor::local_state(&parent.identity, local) {
                LocalState::Live => continue,
                LocalState::DerivedOnly => log::debug!(
                    "[Controller] {} runs from its checkpoint only, not re-checkpointing",
                    parent.identity
                ),
                LocalState::Absent => {
                    log::debug!("[Controller] {} not running on this node yet", parent.identity)
                }
            }
            outcome.skipped += 1;
        }

        for parent in executor::write_candidates(parents, local) {
            match self.checkpoint_parent(parent).await {
                Ok(WriteAction::Create) => outcome.created += 1,
                Ok(WriteAction::Update) => outcome.updated += 1,
                Ok(WriteAction::Unchanged) => outcome.skipped += 1,
                Err(e) => {
                    log::warn!("[Controller] Checkpoint of {} failed: {}", parent.identity, e);
                    outcome.failed += 1;
                }
            }
        }

        // Collection runs strictly after this tick's writes.
        match self.store.list() {
            Ok(stored) => {
                for id in executor::garbage(&stored, parents, local) {
                    match self.store.delete(&id) {
                        Ok(_) => {
                            log::info!("[Controller] Removed checkpoint {}", id);
                            outcome.deleted += 1;
                        }
                        Err(e) => {
                            log::warn!("[Controller] Failed to remove checkpoint {}: {}", id, e);
                            outcome.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("[Controller] Cannot list checkpoints: {}", e);
                outcome.failed += 1;
                return outcome;
            }
        }

        match (self.store.list(), self.store.list_active()) {
            (Ok(stored), Ok(active)) => {
                for id in executor::deactivations(&active, &stored, parents, local) {
                    match self.store.deactivate(&id) {
                        Ok(true) => {
                            log::info!("[Controller] Deactivated checkpoint {}", id);
                            outcome.deactivated += 1;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            log::warn!("[Controller] Failed to deactivate {}: {}", id, e);
                            outcome.failed += 1;
                        }
                    }
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("[Controller] Cannot list active checkpoints: {}", e);
                outcome.failed += 1;
            }
        }
        outcome
    }

    fn degrade(&self, local: &LocalPods, mut outcome: TickOutcome) -> TickOutcome {
        let (stored, active) = match (self.store.list(), self.store.list_active()) {
            (Ok(stored), Ok(active)) => (stored, active),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("[Controller] Cannot list checkpoints: {}", e);
                outcome.failed += 1;
                return outcome;
            }
        };
        outcome.skipped = stored.len() as u32;

        for id in executor::activations(&stored, &active, local) {
            match self.store.activate(&id) {
                Ok(()) => {
                    log::info!("[Controller] Activated checkpoint {}", id);
                    outcome.activated += 1;
                }
                Err(e) => {
                    log::warn!("[Controller] Failed to activate {}: {}", id, e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn checkpoint_parent(&self, parent: &ParentPod) -> Result<WriteAction, ReconcileError> {
        let refs = self.resolve_refs(parent).await?;
        let (manifest, data) = to_checkpoint(parent, &refs, &self.transform)?;
        let stored = self.store.stored_fingerprint(&parent.identity)?;

        let action = executor::write_action(stored.as_deref(), &manifest.fingerprint);
        if action != WriteAction::Unchanged {
            self.store.write(&manifest, &data)?;
            log::info!(
                "[Controller] {:?} checkpoint {} ({})",
                action,
                parent.identity,
                &manifest.fingerprint[..12.min(manifest.fingerprint.len())]
            );
        }
        Ok(action)
    }

    /// Fetch every Secret and ConfigMap the pod references.
    ///
    /// Missing objects are left out; the transform decides whether that is fatal.
    async fn resolve_refs(&self, parent: &ParentPod) -> Result<ResolvedRefs, ClusterError> {
        let refs = referenced_objects(parent);
        let ns = parent.identity.namespace.as_str();

        let secrets = join_all(refs.secrets.keys().map(|name| async move {
            (name, self.bounded(self.cluster.get_secret(ns, name)).await)
        }))
        .await;
        let config_maps = join_all(refs.config_maps.keys().map(|name| async move {
            (name, self.bounded(self.cluster.get_config_map(ns, name)).await)
        }))
        .await;

        let mut resolved = ResolvedRefs::default();
        for (name, result) in secrets {
            match result {
                Ok(data) => {
                    resolved.secrets.insert(name.clone(), data);
                }
                Err(ClusterError::NotFound(_)) => {
                    log::debug!("[Controller] Secret {}/{} not found", ns, name)
                }
                Err(e) => return Err(e),
            }
        }
        for (name, result) in config_maps {
            match result {
                Ok(data) => {
                    resolved.config_maps.insert(name.clone(), data);
                }
                Err(ClusterError::NotFound(_)) => {
                    log::debug!("[Controller] ConfigMap {}/{} not found", ns, name)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }
}
