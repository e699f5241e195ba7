//! Monitoring of deployed evaluation jobs.
//!
//! A monitoring run polls one batch of jobs until every job is terminal,
//! the run times out, polling keeps failing, or the run is cancelled:
//!
//! - [`tick`] folds one poll into the run state (pure)
//! - [`gate`] decides which progress updates are worth sending
//! - [`runner`] drives ticks, persistence and the delay between them
//! - [`manager`] runs many batches concurrently and owns cancellation

pub mod gate;
pub mod manager;
pub mod runner;
pub mod tick;

pub use gate::{decide, NotificationDecision, NotificationReason};
pub use manager::MonitorManager;
pub use runner::{MonitorLoop, TickStep};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notify::NotificationTarget;
use crate::state::{derive_run_id, MonitorState, ProgressRecord, TimingRecord};

/// Default delay between ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default tick budget: eight hours at the default interval.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 960;

/// Default bound on a single collaborator round trip.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Derived from the job IDs when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub job_ids: Vec<String>,
    pub poll_interval_seconds: u64,
    pub max_attempts: u32,
    pub notification_target: NotificationTarget,
}

impl MonitorRequest {
    pub fn run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| derive_run_id(&self.job_ids))
    }

    pub fn into_state(self) -> MonitorState {
        let run_id = self.run_id();
        MonitorState::new(
            run_id,
            self.job_ids,
            self.poll_interval_seconds,
            self.max_attempts,
            self.notification_target,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Completed,
    Timeout,
    Error,
    Cancelled,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Completed => "completed",
            MonitorStatus::Timeout => "timeout",
            MonitorStatus::Error => "error",
            MonitorStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal output of a monitoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorResult {
    pub run_id: String,
    pub status: MonitorStatus,
    pub completed_jobs: Vec<String>,
    pub failed_jobs: Vec<String>,
    pub job_details: BTreeMap<String, TimingRecord>,
    #[serde(default)]
    pub job_progress: BTreeMap<String, ProgressRecord>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MonitorResult {
    pub fn from_state(state: &MonitorState, status: MonitorStatus) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status,
            completed_jobs: state.completed_jobs.iter().cloned().collect(),
            failed_jobs: state.failed_jobs.iter().cloned().collect(),
            job_details: state.job_timing_map.clone(),
            job_progress: state.job_progress_map.clone(),
            attempts: state.attempt,
            error: state.last_error.clone(),
        }
    }

    /// Completed, but not a single job succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.status == MonitorStatus::Completed
            && self.completed_jobs.is_empty()
            && !self.failed_jobs.is_empty()
    }
}
