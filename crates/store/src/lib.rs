//! fnview store: latest-known-state cache for the watched deployment.
//!
//! Every watch event carries the full authoritative object, so reconciliation is a plain
//! overwrite in arrival order. No history is kept and nothing is merged field by field.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use fnview_core::DeploymentSnapshot;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Whether a snapshot has ever been observed for the current target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SnapshotPhase {
    #[default]
    AwaitingFirstSnapshot,
    SnapshotKnown,
}

#[derive(Debug, Clone, Default)]
enum Latest {
    #[default]
    Awaiting,
    Known { snapshot: DeploymentSnapshot, observed_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationState {
    latest: Latest,
    epoch: u64,
}

impl ReconciliationState {
    pub fn new() -> Self { Self::default() }

    /// Replace the stored snapshot unconditionally (last write wins). Returns the new epoch.
    pub fn on_watch_event(&mut self, snapshot: DeploymentSnapshot) -> u64 {
        debug!(
            name = %snapshot.name,
            rv = %snapshot.resource_version.as_deref().unwrap_or("-"),
            epoch = self.epoch + 1,
            "store: snapshot replaced"
        );
        self.latest = Latest::Known { snapshot, observed_at: Utc::now() };
        self.epoch = self.epoch.saturating_add(1);
        self.epoch
    }

    pub fn phase(&self) -> SnapshotPhase {
        match self.latest {
            Latest::Awaiting => SnapshotPhase::AwaitingFirstSnapshot,
            Latest::Known { .. } => SnapshotPhase::SnapshotKnown,
        }
    }

    pub fn snapshot(&self) -> Option<&DeploymentSnapshot> {
        match &self.latest {
            Latest::Known { snapshot, .. } => Some(snapshot),
            Latest::Awaiting => None,
        }
    }

    /// When the current snapshot arrived.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        match &self.latest {
            Latest::Known { observed_at, .. } => Some(*observed_at),
            Latest::Awaiting => None,
        }
    }

    /// Number of snapshots applied so far.
    pub fn epoch(&self) -> u64 { self.epoch }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(rv: &str) -> DeploymentSnapshot {
        DeploymentSnapshot::from_object(serde_json::json!({ "metadata": { "name": "hello", "resourceVersion": rv } }))
            .expect("snapshot")
    }

    #[test]
    fn starts_awaiting_first_snapshot() {
        let st = ReconciliationState::new();
        assert_eq!(st.phase(), SnapshotPhase::AwaitingFirstSnapshot);
        assert!(st.snapshot().is_none());
        assert!(st.observed_at().is_none());
        assert_eq!(st.epoch(), 0);
    }

    #[test]
    fn first_event_switches_phase() {
        let mut st = ReconciliationState::new();
        assert_eq!(st.on_watch_event(snap("1")), 1);
        assert_eq!(st.phase(), SnapshotPhase::SnapshotKnown);
        assert!(st.observed_at().is_some());
    }
}
