//! One tick of the monitor loop as a pure state transition.
//!
//! `advance` folds one status poll and one progress parse into the run
//! state. It performs no I/O and reads no clock, so re-running it on the
//! same state and the same collaborator answers yields the same outcome.

use std::collections::BTreeMap;

use tracing::warn;

use super::gate::{decide_with_completions, NotificationDecision};
use crate::notify::EtaPayload;
use crate::state::{FleetProgress, JobPhase, LastNotification, MonitorState, ProgressRecord, TimingRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTransition {
    /// Jobs remain and attempts are left; tick again after the interval.
    Continue,
    /// Every job is terminal.
    Completed,
    /// Attempts exhausted with jobs still running.
    TimedOut,
}

/// A notification the tick wants sent, with the dedup record to store once
/// it has been delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    pub payload: EtaPayload,
    pub record: LastNotification,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub state: MonitorState,
    pub transition: TickTransition,
    pub newly_completed: Vec<String>,
    pub newly_failed: Vec<String>,
    pub fleet: FleetProgress,
    pub decision: Option<NotificationDecision>,
    pub notification: Option<PendingNotification>,
}

impl TickOutcome {
    /// Records the notification as sent. Only call after delivery succeeded.
    pub fn commit_notification(&mut self) {
        if let Some(pending) = &self.notification {
            self.state.last_notification = Some(pending.record.clone());
        }
    }
}

pub fn advance(
    state: &MonitorState,
    statuses: &BTreeMap<String, TimingRecord>,
    progress: &BTreeMap<String, ProgressRecord>,
) -> TickOutcome {
    let mut next = state.clone();
    next.last_error = None;

    let mut newly_completed = Vec::new();
    let mut newly_failed = Vec::new();

    for (job_id, record) in statuses {
        if !next.job_ids.contains(job_id) {
            warn!(run_id = %state.run_id, job_id = %job_id, "ignoring status for unknown job");
            continue;
        }
        next.job_timing_map.insert(job_id.clone(), record.clone());

        if next.is_terminal_job(job_id) {
            continue;
        }
        match record.phase() {
            JobPhase::Succeeded => {
                next.completed_jobs.insert(job_id.clone());
                newly_completed.push(job_id.clone());
            }
            JobPhase::Failed => {
                next.failed_jobs.insert(job_id.clone());
                newly_failed.push(job_id.clone());
            }
            JobPhase::Running => {}
        }
    }

    let remaining = next.remaining_jobs();
    if remaining.is_empty() {
        return TickOutcome {
            state: next,
            transition: TickTransition::Completed,
            newly_completed,
            newly_failed,
            fleet: FleetProgress::default(),
            decision: None,
            notification: None,
        };
    }

    next.job_progress_map
        .retain(|job_id, _| remaining.binary_search(job_id).is_ok());
    for job_id in &remaining {
        if let Some(record) = progress.get(job_id) {
            next.job_progress_map.insert(job_id.clone(), record.clone());
        }
    }

    let fleet = FleetProgress::aggregate(
        remaining
            .iter()
            .filter_map(|job_id| next.job_progress_map.get(job_id)),
    );
    let completed_count = next.completed_jobs.len();
    let decision = decide_with_completions(
        fleet.avg_progress,
        fleet.remaining_minutes(),
        completed_count,
        state.last_notification.as_ref(),
        state.attempt,
    );

    let notification = decision.should_send.then(|| PendingNotification {
        payload: EtaPayload {
            progress_percentage: fleet.avg_progress,
            remaining_seconds: fleet.worst_remaining_seconds,
            completed_jobs: completed_count,
            total_jobs: next.job_ids.len(),
            running_jobs: remaining.len(),
            failed_jobs: next.failed_jobs.len(),
        },
        record: LastNotification {
            progress_percentage: fleet.avg_progress,
            remaining_minutes: fleet.remaining_minutes(),
            completed_count,
            attempt_sent: state.attempt,
        },
    });

    let transition = if state.attempts_exhausted() {
        TickTransition::TimedOut
    } else {
        next.attempt = state.attempt + 1;
        TickTransition::Continue
    };

    TickOutcome {
        state: next,
        transition,
        newly_completed,
        newly_failed,
        fleet,
        decision: Some(decision),
        notification,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    Retry,
    Error,
}

/// A tick whose collaborator calls failed: retry with the next attempt, or
/// give up once attempts are exhausted. Nothing else in the state changes.
pub fn advance_after_failure(state: &MonitorState, error: &str) -> (MonitorState, FailureTransition) {
    let mut next = state.clone();
    next.last_error = Some(error.to_string());
    if state.attempts_exhausted() {
        (next, FailureTransition::Error)
    } else {
        next.attempt = state.attempt + 1;
        (next, FailureTransition::Retry)
    }
}
