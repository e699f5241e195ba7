//! Monitor state management.
//!
//! `MonitorState` is the single serializable unit of truth for one
//! monitoring run. It is persisted after every tick inside a versioned
//! envelope so a restarted process resumes exactly where the run left off.

mod job;
mod progress;

pub use job::{ErrorDetails, JobPhase, TimingRecord};
pub use progress::{EtaData, FleetProgress, LatestProgress, ProgressRecord, ProgressStatus};

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::notify::NotificationTarget;

/// Current on-disk schema version for `MonitorState`.
pub const STATE_VERSION: u32 = 1;

/// Snapshot of the last notification actually emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastNotification {
    pub progress_percentage: f64,
    pub remaining_minutes: u64,
    pub completed_count: usize,
    pub attempt_sent: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    pub run_id: String,
    pub job_ids: BTreeSet<String>,
    /// Attempt number of the next tick to execute.
    pub attempt: u32,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub completed_jobs: BTreeSet<String>,
    pub failed_jobs: BTreeSet<String>,
    pub job_timing_map: BTreeMap<String, TimingRecord>,
    pub job_progress_map: BTreeMap<String, ProgressRecord>,
    pub last_notification: Option<LastNotification>,
    pub notification_target: NotificationTarget,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MonitorState {
    pub fn new(
        run_id: impl Into<String>,
        job_ids: impl IntoIterator<Item = String>,
        poll_interval_secs: u64,
        max_attempts: u32,
        notification_target: NotificationTarget,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            job_ids: job_ids.into_iter().collect(),
            attempt: 1,
            poll_interval_secs,
            max_attempts,
            completed_jobs: BTreeSet::new(),
            failed_jobs: BTreeSet::new(),
            job_timing_map: BTreeMap::new(),
            job_progress_map: BTreeMap::new(),
            last_notification: None,
            notification_target,
            started_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn is_terminal_job(&self, job_id: &str) -> bool {
        self.completed_jobs.contains(job_id) || self.failed_jobs.contains(job_id)
    }

    /// `job_ids - completed_jobs - failed_jobs`, in job ID order.
    pub fn remaining_jobs(&self) -> Vec<String> {
        self.job_ids
            .iter()
            .filter(|id| !self.is_terminal_job(id))
            .cloned()
            .collect()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Checks the set invariants: terminal sets are disjoint and drawn from
    /// `job_ids`.
    pub fn invariants_hold(&self) -> bool {
        self.completed_jobs.is_disjoint(&self.failed_jobs)
            && self.completed_jobs.is_subset(&self.job_ids)
            && self.failed_jobs.is_subset(&self.job_ids)
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        let envelope = EnvelopeOut {
            version: STATE_VERSION,
            state: self,
        };
        Ok(serde_json::to_string_pretty(&envelope)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let envelope: EnvelopeIn = serde_json::from_str(raw)?;
        match envelope.version {
            STATE_VERSION => Ok(serde_json::from_value(envelope.state)?),
            found => Err(StoreError::UnsupportedVersion {
                found,
                supported: STATE_VERSION,
            }),
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    version: u32,
    state: &'a MonitorState,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    state: serde_json::Value,
}

/// Stable run ID for a job batch, independent of the order the IDs arrive in.
pub fn derive_run_id<'a>(job_ids: impl IntoIterator<Item = &'a String>) -> String {
    let mut hasher = Sha256::new();
    for id in job_ids.into_iter().sorted().dedup() {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    format!(
        "run-{}",
        digest.iter().take(8).map(|b| format!("{:02x}", b)).join("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn target() -> NotificationTarget {
        NotificationTarget {
            workflow_id: "wf".into(),
            topic: "topic".into(),
            source: "test".into(),
        }
    }

    fn sample() -> MonitorState {
        let mut state = MonitorState::new(
            "run-1",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            30,
            10,
            target(),
        );
        state.completed_jobs.insert("a".into());
        state.failed_jobs.insert("b".into());
        state
            .job_timing_map
            .insert("a".into(), TimingRecord::new("succeeded"));
        state
            .job_progress_map
            .insert("c".into(), ProgressRecord::pending());
        state.last_notification = Some(LastNotification {
            progress_percentage: 12.0,
            remaining_minutes: 3,
            completed_count: 1,
            attempt_sent: 2,
        });
        state.attempt = 4;
        state
    }

    #[test]
    fn remaining_jobs_excludes_terminal() {
        assert_eq!(sample().remaining_jobs(), vec!["c".to_string()]);
        assert!(sample().invariants_hold());
    }

    #[test]
    fn versioned_json_round_trip_preserves_attempt() {
        let state = sample();
        let restored = MonitorState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.attempt, 4);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let raw = r#"{"version": 99, "state": {}}"#;
        match MonitorState::from_json(raw) {
            Err(StoreError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, STATE_VERSION);
            }
            other => panic!("expected version error, got {:?}", other),
        }
    }

    #[test]
    fn run_id_is_order_independent() {
        let forward = vec!["job-1".to_string(), "job-2".to_string()];
        let reverse = vec!["job-2".to_string(), "job-1".to_string()];
        assert_eq!(derive_run_id(&forward), derive_run_id(&reverse));
        assert_ne!(derive_run_id(&forward), derive_run_id(&forward[..1]));
        assert!(derive_run_id(&forward).starts_with("run-"));
    }
}
