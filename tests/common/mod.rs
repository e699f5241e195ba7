//! Scripted Cluster Executor shared by the integration tests.
//!
//! Each job follows a fixed list of steps. Every successful status poll
//! serves the job's next step (the last step repeats forever); progress
//! parsing reports the step most recently served.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use evalwatch::cluster::{
    ClusterExecutor, ExtractionResult, JobDescriptor, LogProgressReader, StatusPoller,
};
use evalwatch::error::CollaboratorError;
use evalwatch::notify::{EtaPayload, Notification, NotificationEvent, NotificationTarget};
use evalwatch::state::{ErrorDetails, JobPhase, LatestProgress, ProgressRecord, ProgressStatus, TimingRecord};

#[derive(Debug, Clone)]
pub struct Step {
    pub status: &'static str,
    pub progress: ProgressRecord,
    pub error: Option<ErrorDetails>,
}

pub fn pending() -> Step {
    Step {
        status: "pending",
        progress: ProgressRecord::pending(),
        error: None,
    }
}

pub fn running(percentage: f64, remaining_seconds: f64) -> Step {
    Step {
        status: "running",
        progress: ProgressRecord {
            status: ProgressStatus::Running,
            eta_data: None,
            latest_progress: Some(LatestProgress {
                remaining_seconds,
                batches_completed: percentage as u64,
                batches_total: 100,
            }),
            progress_percentage: percentage,
        },
        error: None,
    }
}

pub fn succeeded() -> Step {
    Step {
        status: "succeeded",
        progress: ProgressRecord::no_logs(),
        error: None,
    }
}

pub fn failed(details: Option<ErrorDetails>) -> Step {
    Step {
        status: "failed",
        progress: ProgressRecord::no_logs(),
        error: details,
    }
}

#[derive(Default)]
struct Calls {
    served: BTreeMap<String, usize>,
    poll_calls: Vec<Vec<String>>,
    extract_calls: Vec<Vec<String>>,
    failing_polls: u32,
}

#[derive(Default)]
pub struct ScriptedCluster {
    scripts: BTreeMap<String, Vec<Step>>,
    unreachable: bool,
    deploy_error: Option<CollaboratorError>,
    extraction_fails: bool,
    calls: Mutex<Calls>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, job_id: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(job_id.to_string(), steps);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn deploy_error(mut self, error: CollaboratorError) -> Self {
        self.deploy_error = Some(error);
        self
    }

    pub fn extraction_fails(mut self) -> Self {
        self.extraction_fails = true;
        self
    }

    /// The next `count` status polls fail as unavailable.
    pub fn fail_next_polls(&self, count: u32) {
        self.calls.lock().unwrap().failing_polls = count;
    }

    pub fn poll_calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().poll_calls.clone()
    }

    pub fn extract_calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().extract_calls.clone()
    }

    fn step(&self, job_id: &str, index: usize) -> Option<&Step> {
        let steps = self.scripts.get(job_id)?;
        steps.get(index.min(steps.len().saturating_sub(1)))
    }
}

#[async_trait]
impl StatusPoller for ScriptedCluster {
    async fn poll(
        &self,
        job_ids: &[String],
    ) -> Result<BTreeMap<String, TimingRecord>, CollaboratorError> {
        let mut calls = self.calls.lock().unwrap();
        calls.poll_calls.push(job_ids.to_vec());
        if calls.failing_polls > 0 {
            calls.failing_polls -= 1;
            return Err(CollaboratorError::Unavailable("scripted outage".into()));
        }

        let mut statuses = BTreeMap::new();
        for job_id in job_ids {
            let index = calls.served.get(job_id).map_or(0, |served| served + 1);
            if let Some(step) = self.step(job_id, index) {
                calls.served.insert(job_id.clone(), index);
                let mut record = TimingRecord::new(step.status);
                record.error_details = step.error.clone();
                statuses.insert(job_id.clone(), record);
            }
        }
        Ok(statuses)
    }
}

#[async_trait]
impl LogProgressReader for ScriptedCluster {
    async fn parse(
        &self,
        job_ids: &[String],
    ) -> Result<BTreeMap<String, ProgressRecord>, CollaboratorError> {
        let calls = self.calls.lock().unwrap();
        let mut progress = BTreeMap::new();
        for job_id in job_ids {
            let index = calls.served.get(job_id).copied().unwrap_or(0);
            if let Some(step) = self.step(job_id, index) {
                progress.insert(job_id.clone(), step.progress.clone());
            }
        }
        Ok(progress)
    }
}

#[async_trait]
impl ClusterExecutor for ScriptedCluster {
    async fn verify_reachable(&self) -> Result<(), CollaboratorError> {
        if self.unreachable {
            Err(CollaboratorError::Unavailable("scripted cluster is down".into()))
        } else {
            Ok(())
        }
    }

    /// Job IDs are `job-<benchmark>`.
    async fn deploy(&self, jobs: &[JobDescriptor]) -> Result<Vec<String>, CollaboratorError> {
        if let Some(error) = &self.deploy_error {
            return Err(error.clone());
        }
        Ok(jobs
            .iter()
            .map(|job| format!("job-{}", job.benchmark))
            .collect())
    }

    async fn extract(
        &self,
        eval_id: &str,
        job_ids: &[String],
        timing: &BTreeMap<String, TimingRecord>,
    ) -> Result<ExtractionResult, CollaboratorError> {
        self.calls.lock().unwrap().extract_calls.push(job_ids.to_vec());

        let mut extracted = Vec::new();
        let mut failed = BTreeMap::new();
        for job_id in job_ids {
            let succeeded = timing
                .get(job_id)
                .is_some_and(|record| record.phase() == JobPhase::Succeeded);
            if succeeded && !self.extraction_fails {
                extracted.push(job_id.clone());
            } else {
                failed.insert(job_id.clone(), "results file missing".to_string());
            }
        }
        Ok(ExtractionResult {
            eval_id: eval_id.to_string(),
            extracted_jobs: extracted,
            failed_extractions: failed,
            summary: json!({ "jobs": job_ids.len() }),
        })
    }
}

pub fn target(workflow_id: &str) -> NotificationTarget {
    NotificationTarget {
        workflow_id: workflow_id.into(),
        topic: "evaluation-progress".into(),
        source: "evalwatch-tests".into(),
    }
}

/// Everything currently buffered on the channel.
pub fn drain(receiver: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
    let mut notifications = Vec::new();
    while let Ok(notification) = receiver.try_recv() {
        notifications.push(notification);
    }
    notifications
}

pub fn eta_payloads(notifications: &[Notification]) -> Vec<EtaPayload> {
    notifications
        .iter()
        .filter_map(|n| match &n.event {
            NotificationEvent::Eta(payload) => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

/// `start`/`ok`/`fail` plus the stage label, in emission order.
pub fn stage_trail(notifications: &[Notification]) -> Vec<String> {
    notifications
        .iter()
        .filter_map(|n| match &n.event {
            NotificationEvent::StageStarted { label, .. } => Some(format!("start {}", label)),
            NotificationEvent::StageSucceeded { label, .. } => Some(format!("ok {}", label)),
            NotificationEvent::StageFailed { label, .. } => Some(format!("fail {}", label)),
            NotificationEvent::Eta(_) => None,
        })
        .collect()
}
