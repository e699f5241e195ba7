//! The monitor loop driver.
//!
//! Each run is a sequence of ticks separated by `poll_interval`. State is
//! persisted after every tick, before the delay, so a restarted process
//! re-enters the loop at the persisted attempt. The loop never fails past
//! its own boundary: every outcome is encoded in `MonitorResult::status`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::tick::{self, FailureTransition, TickTransition};
use super::{MonitorRequest, MonitorResult, MonitorStatus};
use crate::cluster::{ClusterHandles, LogProgressReader, StatusPoller};
use crate::error::CollaboratorError;
use crate::notify::{NotificationEvent, Notifier};
use crate::state::MonitorState;
use crate::store::StateStore;

/// What the driver should do after a tick.
#[derive(Debug)]
pub enum TickStep {
    /// Persist this state and tick again after the interval.
    Continue(MonitorState),
    Finished(MonitorResult),
}

pub struct MonitorLoop {
    poller: Arc<dyn StatusPoller>,
    reader: Arc<dyn LogProgressReader>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn StateStore>,
    call_timeout: Duration,
}

impl MonitorLoop {
    pub fn new(
        poller: Arc<dyn StatusPoller>,
        reader: Arc<dyn LogProgressReader>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn StateStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            poller,
            reader,
            notifier,
            store,
            call_timeout,
        }
    }

    pub fn from_cluster(
        cluster: &ClusterHandles,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn StateStore>,
        call_timeout: Duration,
    ) -> Self {
        Self::new(
            cluster.poller.clone(),
            cluster.reader.clone(),
            notifier,
            store,
            call_timeout,
        )
    }

    /// Starts a run, or picks up the persisted state of the same run.
    /// Persisted state is only reused when it tracks the same job batch.
    pub async fn run(&self, request: MonitorRequest, cancel: CancellationToken) -> MonitorResult {
        let run_id = request.run_id();
        let batch: BTreeSet<String> = request.job_ids.iter().cloned().collect();
        let state = match self.store.load(&run_id).await {
            Ok(Some(existing)) if existing.job_ids == batch => {
                info!(run_id = %run_id, attempt = existing.attempt, "resuming persisted monitor run");
                existing
            }
            Ok(Some(stale)) => {
                warn!(
                    run_id = %run_id,
                    persisted_jobs = stale.job_ids.len(),
                    requested_jobs = batch.len(),
                    "persisted state belongs to a different job batch, starting fresh"
                );
                request.into_state()
            }
            Ok(None) => request.into_state(),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "cannot read persisted state, starting fresh");
                request.into_state()
            }
        };
        self.persist(&state).await;
        self.drive(state, cancel).await
    }

    /// Re-drives a persisted run. `None` when nothing is stored for it.
    pub async fn resume(&self, run_id: &str, cancel: CancellationToken) -> Option<MonitorResult> {
        match self.store.load(run_id).await {
            Ok(Some(state)) => {
                info!(run_id, attempt = state.attempt, "resuming monitor run");
                Some(self.drive(state, cancel).await)
            }
            Ok(None) => None,
            Err(e) => {
                error!(run_id, error = %e, "cannot resume monitor run");
                None
            }
        }
    }

    /// Ticks until the run reaches a terminal outcome.
    pub async fn drive(&self, mut state: MonitorState, cancel: CancellationToken) -> MonitorResult {
        info!(
            run_id = %state.run_id,
            jobs = state.job_ids.len(),
            attempt = state.attempt,
            max_attempts = state.max_attempts,
            "monitoring jobs"
        );

        loop {
            if cancel.is_cancelled() {
                info!(run_id = %state.run_id, attempt = state.attempt, "monitor run cancelled");
                let mut result = MonitorResult::from_state(&state, MonitorStatus::Cancelled);
                result.attempts = state.attempt.saturating_sub(1);
                self.discard(&state.run_id).await;
                return result;
            }

            match self.tick(&state).await {
                TickStep::Continue(next) => {
                    state = next;
                    self.persist(&state).await;
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(state.poll_interval()) => {}
                    }
                }
                TickStep::Finished(result) => {
                    info!(
                        run_id = %result.run_id,
                        status = ?result.status,
                        completed = result.completed_jobs.len(),
                        failed = result.failed_jobs.len(),
                        attempts = result.attempts,
                        "monitor run finished"
                    );
                    self.discard(&result.run_id).await;
                    return result;
                }
            }
        }
    }

    /// Executes one tick against the collaborators.
    pub async fn tick(&self, state: &MonitorState) -> TickStep {
        let span = info_span!("tick", run_id = %state.run_id, attempt = state.attempt);
        self.tick_inner(state).instrument(span).await
    }

    async fn tick_inner(&self, state: &MonitorState) -> TickStep {
        let pending = state.remaining_jobs();
        let (polled, parsed) = futures::join!(
            self.bounded(self.poller.poll(&pending)),
            self.bounded(self.reader.parse(&pending)),
        );

        let statuses = match polled {
            Ok(statuses) => statuses,
            Err(e) => return self.on_failure(state, "status poll", e),
        };

        let (progress, parse_error) = match parsed {
            Ok(progress) => (progress, None),
            Err(e) => (BTreeMap::new(), Some(e)),
        };

        let mut outcome = tick::advance(state, &statuses, &progress);
        if let Some(e) = parse_error {
            if outcome.transition != TickTransition::Completed {
                return self.on_failure(state, "progress parse", e);
            }
        }

        for job_id in &outcome.newly_completed {
            info!(job_id = %job_id, "job succeeded");
        }
        for job_id in &outcome.newly_failed {
            warn!(job_id = %job_id, "job failed");
        }
        if let Some(decision) = outcome.decision {
            debug!(
                progress = outcome.fleet.avg_progress,
                remaining_seconds = outcome.fleet.worst_remaining_seconds,
                send = decision.should_send,
                reason = %decision.reason,
                "notification decision"
            );
        }

        if let Some(pending) = &outcome.notification {
            let event = NotificationEvent::Eta(pending.payload.clone());
            let delivery = tokio::time::timeout(
                self.call_timeout,
                self.notifier.notify(&state.notification_target, &event),
            )
            .await;
            match delivery {
                Ok(Ok(())) => outcome.commit_notification(),
                Ok(Err(e)) => warn!(error = %e, "progress notification not delivered"),
                Err(_) => warn!(
                    timeout = ?self.call_timeout,
                    "progress notification timed out"
                ),
            }
        }

        match outcome.transition {
            TickTransition::Continue => TickStep::Continue(outcome.state),
            TickTransition::Completed => TickStep::Finished(MonitorResult::from_state(
                &outcome.state,
                MonitorStatus::Completed,
            )),
            TickTransition::TimedOut => {
                warn!(
                    remaining = outcome.state.remaining_jobs().len(),
                    "attempts exhausted with jobs still running"
                );
                TickStep::Finished(MonitorResult::from_state(
                    &outcome.state,
                    MonitorStatus::Timeout,
                ))
            }
        }
    }

    fn on_failure(&self, state: &MonitorState, call: &str, error: CollaboratorError) -> TickStep {
        let (next, transition) = tick::advance_after_failure(state, &error.to_string());
        match transition {
            FailureTransition::Retry => {
                warn!(call, error = %error, "transient collaborator failure, retrying");
                TickStep::Continue(next)
            }
            FailureTransition::Error => {
                error!(call, error = %error, "collaborator failure with no attempts left");
                TickStep::Finished(MonitorResult::from_state(&next, MonitorStatus::Error))
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(self.call_timeout)),
        }
    }

    async fn persist(&self, state: &MonitorState) {
        if let Err(e) = self.store.save(&state.run_id, state).await {
            warn!(run_id = %state.run_id, attempt = state.attempt, error = %e, "monitor state not persisted");
        }
    }

    async fn discard(&self, run_id: &str) {
        if let Err(e) = self.store.remove(run_id).await {
            warn!(run_id, error = %e, "cannot remove finished monitor state");
        }
    }
}
