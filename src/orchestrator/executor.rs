//! Pure reconciliation decisions.
//!
//! Every function here maps observations (parent list, agent view, store
//! contents) to the identities an action applies to. The controller performs
//! the I/O; these only decide.

use std::collections::BTreeSet;

use crate::models::{LocalPods, ParentPod, PodIdentity};

/// How the agent sees a parent pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// Running because the cluster scheduled it.
    Live,
    /// Only a checkpoint-derived instance is running.
    DerivedOnly,
    /// Not running on this node (yet).
    Absent,
}

pub fn local_state(id: &PodIdentity, local: &LocalPods) -> LocalState {
    match local.get(id) {
        Some(pod) if pod.is_live() => LocalState::Live,
        Some(_) => LocalState::DerivedOnly,
        None => LocalState::Absent,
    }
}

/// Result of comparing a freshly built checkpoint with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Unchanged,
}

pub fn write_action(stored: Option<&str>, fresh: &str) -> WriteAction {
    match stored {
        None => WriteAction::Create,
        Some(fp) if fp == fresh => WriteAction::Unchanged,
        Some(_) => WriteAction::Update,
    }
}

/// Parents eligible for a checkpoint write this tick: only those live locally.
pub fn write_candidates<'a>(parents: &'a [ParentPod], local: &LocalPods) -> Vec<&'a ParentPod> {
    parents
        .iter()
        .filter(|p| local_state(&p.identity, local) == LocalState::Live)
        .collect()
}

/// Stored checkpoints absent from both the parent list and the agent view.
pub fn garbage(
    stored: &BTreeSet<PodIdentity>,
    parents: &[ParentPod],
    local: &LocalPods,
) -> Vec<PodIdentity> {
    let listed: BTreeSet<&PodIdentity> = parents.iter().map(|p| &p.identity).collect();
    stored
        .iter()
        .filter(|id| !listed.contains(id) && !local.contains_key(*id))
        .cloned()
        .collect()
}

/// Active copies to withdraw after a successful sync.
///
/// `stored` must reflect the store after this tick's writes and deletes.
pub fn deactivations(
    active: &BTreeSet<PodIdentity>,
    stored: &BTreeSet<PodIdentity>,
    parents: &[ParentPod],
    local: &LocalPods,
) -> Vec<PodIdentity> {
    let listed: BTreeSet<&PodIdentity> = parents.iter().map(|p| &p.identity).collect();
    active
        .iter()
        .filter(|id| {
            local_state(id, local) == LocalState::Live
                || !stored.contains(*id)
                || !listed.contains(id)
        })
        .cloned()
        .collect()
}

/// Stored checkpoints to hand to the agent while the cluster is unreachable.
pub fn activations(
    stored: &BTreeSet<PodIdentity>,
    active: &BTreeSet<PodIdentity>,
    local: &LocalPods,
) -> Vec<PodIdentity> {
    stored
        .iter()
        .filter(|id| !active.contains(*id) && local_state(id, local) != LocalState::Live)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActiveLocalPod, Pod, PodPhase};

    fn id(name: &str) -> PodIdentity {
        PodIdentity::new("kube-system", name)
    }

    fn parent(name: &str) -> ParentPod {
        let mut pod = Pod::default();
        pod.metadata.namespace = "kube-system".into();
        pod.metadata.name = name.into();
        ParentPod::new(pod)
    }

    fn local(entries: &[(&str, bool)]) -> LocalPods {
        entries
            .iter()
            .map(|(name, derived)| {
                (
                    id(name),
                    ActiveLocalPod {
                        identity: id(name),
                        phase: PodPhase::Running,
                        checkpoint_derived: *derived,
                    },
                )
            })
            .collect()
    }

    fn set(names: &[&str]) -> BTreeSet<PodIdentity> {
        names.iter().map(|n| id(n)).collect()
    }

    #[test]
    fn test_write_action() {
        assert_eq!(write_action(None, "a"), WriteAction::Create);
        assert_eq!(write_action(Some("a"), "a"), WriteAction::Unchanged);
        assert_eq!(write_action(Some("a"), "b"), WriteAction::Update);
    }

    #[test]
    fn test_write_candidates_exclude_derived_and_absent() {
        let parents = vec![parent("api"), parent("sched"), parent("cm")];
        let local = local(&[("api", false), ("sched", true)]);
        let names: Vec<_> = write_candidates(&parents, &local)
            .iter()
            .map(|p| p.identity.name.clone())
            .collect();
        assert_eq!(names, vec!["api"]);
    }

    #[test]
    fn test_garbage_requires_absence_from_both_views() {
        let stored = set(&["api", "sched", "old", "derived"]);
        let parents = vec![parent("api")];
        let local = local(&[("sched", false), ("derived", true)]);
        assert_eq!(garbage(&stored, &parents, &local), vec![id("old")]);
    }

    #[test]
    fn test_deactivations() {
        let active = set(&["api", "orphan", "gone", "waiting"]);
        let stored = set(&["api", "gone", "waiting"]);
        let parents = vec![parent("api"), parent("orphan"), parent("waiting")];
        let local = local(&[("api", false), ("gone", true), ("waiting", true)]);
        assert_eq!(
            deactivations(&active, &stored, &parents, &local),
            vec![id("api"), id("gone"), id("orphan")]
        );
    }

    #[test]
    fn test_activations_skip_live_and_already_active() {
        let stored = set(&["api", "sched", "cm"]);
        let active = set(&["cm"]);
        let local = local(&[("api", false)]);
        assert_eq!(activations(&stored, &active, &local), vec![id("sched")]);
    }
}
