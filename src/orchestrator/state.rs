//! Per-tick outcome and the published sync status.
//!
//! A `TickOutcome` is recomputed from scratch every tick and never persisted.
//! `SyncStatus` is the last outcome plus the few facts an external health
//! check wants: how many ticks ran and when the cluster was last reachable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which branch of reconciliation a tick took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickMode {
    /// Cluster API answered; checkpoints were written and collected.
    Synced,
    /// Cluster API failed or timed out; only activation was considered.
    Degraded,
}

impl TickMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickMode::Synced => "synced",
            TickMode::Degraded => "degraded",
        }
    }
}

/// Counts for one reconciliation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutcome {
    pub mode: TickMode,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub skipped: u32,
    pub failed: u32,
    pub activated: u32,
    pub deactivated: u32,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TickOutcome {
    pub fn new(mode: TickMode, started_at: DateTime<Utc>) -> Self {
        TickOutcome {
            mode,
            created: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            activated: 0,
            deactivated: 0,
            started_at,
            duration: Duration::ZERO,
        }
    }

    pub fn api_reachable(&self) -> bool {
        self.mode == TickMode::Synced
    }

    /// Checkpoint writes plus deletes.
    pub fn store_mutations(&self) -> u32 {
        self.created + self.updated + self.deleted
    }

    /// Nothing written, deleted or failed in the store.
    pub fn is_all_skip(&self) -> bool {
        self.store_mutations() == 0 && self.failed == 0
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode={} created={} updated={} deleted={} skipped={} failed={} activated={} deactivated={} duration_ms={}",
            self.mode.as_str(),
            self.created,
            self.updated,
            self.deleted,
            self.skipped,
            self.failed,
            self.activated,
            self.deactivated,
            self.duration.as_millis()
        )
    }
}

/// Latest controller state, published on a watch channel after every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub ticks: u64,
    pub last_outcome: Option<TickOutcome>,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

impl SyncStatus {
    /// Fold a finished tick into the status.
    pub fn record(&mut self, outcome: TickOutcome) {
        self.ticks += 1;
        if outcome.api_reachable() {
            self.last_successful_sync = Some(outcome.started_at);
        }
        self.last_outcome = Some(outcome);
    }

    /// Time since the cluster was last reachable, measured against `now`.
    pub fn staleness(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_successful_sync.map(|ts| now - ts)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_skip_ignores_activation() {
        let mut outcome = TickOutcome::new(TickMode::Degraded, Utc::now());
        outcome.skipped = 2;
        outcome.activated = 1;
        assert!(outcome.is_all_skip());
        outcome.failed = 1;
        assert!(!outcome.is_all_skip());
    }

    #[test]
    fn test_status_tracks_last_successful_sync() {
        let mut status = SyncStatus::default();
        let synced_at = Utc::now();
        status.record(TickOutcome::new(TickMode::Synced, synced_at));
        status.record(TickOutcome::new(TickMode::Degraded, synced_at + chrono::Duration::seconds(3)));

        assert_eq!(status.ticks, 2);
        assert_eq!(status.last_successful_sync, Some(synced_at));
        assert_eq!(
            status.last_outcome.as_ref().map(|o| o.mode),
            Some(TickMode::Degraded)
        );
        assert_eq!(
            status.staleness(synced_at + chrono::Duration::seconds(10)),
            Some(chrono::Duration::seconds(10))
        );
    }

    #[test]
    fn test_outcome_display_and_serde() {
        let mut outcome = TickOutcome::new(TickMode::Synced, Utc::now());
        outcome.created = 1;
        outcome.duration = Duration::from_millis(42);
        let line = outcome.to_string();
        assert!(line.starts_with("mode=synced created=1"));
        assert!(line.ends_with("duration_ms=42"));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["duration"], serde_json::json!(42));
        assert_eq!(json["mode"], serde_json::json!("synced"));
    }
}
