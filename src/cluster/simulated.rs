//! Simulated Cluster Executor.
//!
//! Stands in for a real cluster in demo mode: jobs wait in `pending` for a
//! few polls, print tqdm progress bars while running, then succeed or fail
//! with categorized error details. Every status poll advances the jobs it is
//! asked about by one step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::logparse;
use super::{ClusterExecutor, ExtractionResult, JobDescriptor, LogProgressReader, StatusPoller};
use crate::error::CollaboratorError;
use crate::state::{ErrorDetails, JobPhase, ProgressRecord, TimingRecord};

/// Knobs for the simulation.
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    /// Polls a job spends waiting for resources, drawn from this range.
    pub pending_polls: (u32, u32),
    pub total_batches: u64,
    /// Batches finished per poll while running, drawn from this range.
    pub batches_per_poll: (u64, u64),
    /// Probability that a job fails partway through.
    pub failure_rate: f64,
    pub reachable: bool,
    pub seed: Option<u64>,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            pending_polls: (1, 3),
            total_batches: 200,
            batches_per_poll: (10, 40),
            failure_rate: 0.1,
            reachable: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
enum SimPhase {
    Pending { polls_left: u32 },
    Running,
    Succeeded,
    Failed(ErrorDetails),
}

#[derive(Debug, Clone)]
struct SimJob {
    descriptor: JobDescriptor,
    phase: SimPhase,
    completed_batches: u64,
    seconds_per_batch: f64,
    fail_at: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

struct SimWorld {
    rng: StdRng,
    jobs: BTreeMap<String, SimJob>,
    next_id: u64,
}

pub struct SimulatedCluster {
    profile: SimulationProfile,
    world: Mutex<SimWorld>,
}

impl SimulatedCluster {
    pub fn new(profile: SimulationProfile) -> Self {
        let rng = match profile.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            profile,
            world: Mutex::new(SimWorld {
                rng,
                jobs: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    fn spawn_job(profile: &SimulationProfile, rng: &mut StdRng, descriptor: JobDescriptor) -> SimJob {
        let (low, high) = profile.pending_polls;
        let polls_left = rng.gen_range(low..=high.max(low)).max(1);
        let fail_at = rng
            .gen_bool(profile.failure_rate.clamp(0.0, 1.0))
            .then(|| profile.total_batches / 2);
        SimJob {
            descriptor,
            phase: SimPhase::Pending { polls_left },
            completed_batches: 0,
            seconds_per_batch: rng.gen_range(0.5..3.0),
            fail_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Registers jobs deployed by an earlier process so a resumed run has
    /// something to poll. Known IDs are left alone. Returns how many were
    /// adopted.
    pub async fn adopt(&self, job_ids: &[String]) -> usize {
        let mut world = self.world.lock().await;
        let mut adopted = 0;
        for job_id in job_ids {
            if world.jobs.contains_key(job_id) {
                continue;
            }
            let benchmark = job_id
                .splitn(3, '-')
                .nth(2)
                .unwrap_or(job_id.as_str())
                .to_string();
            let descriptor = JobDescriptor {
                name: job_id.clone(),
                benchmark,
                model: "resumed".into(),
                params: serde_json::Value::Null,
            };
            let job = Self::spawn_job(&self.profile, &mut world.rng, descriptor);
            world.jobs.insert(job_id.clone(), job);
            adopted += 1;
        }
        adopted
    }

    fn sample_failure(rng: &mut StdRng) -> ErrorDetails {
        let failures = [
            ErrorDetails {
                category: "dataset_missing".into(),
                error_type: "FileNotFoundError".into(),
                message: "Dataset 'hellaswag' not found in local cache".into(),
                file: Some("datasets/load.py".into()),
                line: Some(1723),
            },
            ErrorDetails {
                category: String::new(),
                error_type: "RuntimeError".into(),
                message: "CUDA out of memory. Tried to allocate 2.00 GiB".into(),
                file: Some("torch/nn/modules/module.py".into()),
                line: Some(1501),
            },
            ErrorDetails {
                category: "configuration".into(),
                error_type: "ValueError".into(),
                message: "Unknown task name 'mmlu_pro_x'".into(),
                file: None,
                line: None,
            },
            ErrorDetails {
                category: String::new(),
                error_type: "ConnectionError".into(),
                message: "Connection reset while downloading model weights".into(),
                file: None,
                line: None,
            },
        ];
        failures.choose(rng).cloned().unwrap_or_default()
    }

    fn advance(profile: &SimulationProfile, rng: &mut StdRng, job: &mut SimJob) {
        let now = Utc::now();
        match job.phase.clone() {
            SimPhase::Pending { polls_left } if polls_left > 1 => {
                job.phase = SimPhase::Pending {
                    polls_left: polls_left - 1,
                };
            }
            SimPhase::Pending { .. } => {
                job.phase = SimPhase::Running;
                job.started_at = Some(now);
            }
            SimPhase::Running => {
                let (low, high) = profile.batches_per_poll;
                let step = rng.gen_range(low..=high.max(low));
                job.completed_batches = (job.completed_batches + step).min(profile.total_batches);

                if let Some(fail_at) = job.fail_at {
                    if job.completed_batches >= fail_at {
                        job.phase = SimPhase::Failed(Self::sample_failure(rng));
                        job.finished_at = Some(now);
                        return;
                    }
                }
                if job.completed_batches >= profile.total_batches {
                    job.phase = SimPhase::Succeeded;
                    job.finished_at = Some(now);
                }
            }
            SimPhase::Succeeded | SimPhase::Failed(_) => {}
        }
    }

    fn timing_record(job: &SimJob) -> TimingRecord {
        let (status, error_details) = match &job.phase {
            SimPhase::Pending { .. } => ("pending", None),
            SimPhase::Running => ("running", None),
            SimPhase::Succeeded => ("succeeded", None),
            SimPhase::Failed(details) => ("failed", Some(details.clone())),
        };
        let mut record = TimingRecord::new(status);
        record.start_time = job.started_at;
        record.completion_time = job.finished_at;
        record.duration_seconds = record.duration();
        record.error_details = error_details;
        record
    }

    /// Captured output the job would have printed so far.
    fn render_output(profile: &SimulationProfile, job: &SimJob) -> String {
        if job.completed_batches == 0 {
            return format!("Loading model {}\n", job.descriptor.model);
        }
        let total = profile.total_batches;
        let done = job.completed_batches;
        let percent = done * 100 / total.max(1);
        let filled = (percent / 10) as usize;
        let bar = format!("{}{}", "#".repeat(filled), " ".repeat(10 - filled.min(10)));
        let elapsed = done as f64 * job.seconds_per_batch;
        let remaining = total.saturating_sub(done) as f64 * job.seconds_per_batch;
        format!(
            "Loading model {}\n{}: {:>3}%|{}| {}/{} [{}<{}, {:.2}s/it]\n",
            job.descriptor.model,
            job.descriptor.benchmark,
            percent,
            bar,
            done,
            total,
            format_clock(elapsed),
            format_clock(remaining),
            job.seconds_per_batch
        )
    }
}

fn format_clock(seconds: f64) -> String {
    let seconds = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[async_trait]
impl StatusPoller for SimulatedCluster {
    async fn poll(
        &self,
        job_ids: &[String],
    ) -> Result<BTreeMap<String, TimingRecord>, CollaboratorError> {
        if !self.profile.reachable {
            return Err(CollaboratorError::Unavailable("simulated cluster is down".into()));
        }
        let mut world = self.world.lock().await;
        let SimWorld { rng, jobs, .. } = &mut *world;

        let mut statuses = BTreeMap::new();
        for job_id in job_ids {
            if let Some(job) = jobs.get_mut(job_id) {
                Self::advance(&self.profile, rng, job);
                statuses.insert(job_id.clone(), Self::timing_record(job));
            }
        }
        debug!(requested = job_ids.len(), answered = statuses.len(), "simulated status poll");
        Ok(statuses)
    }
}

#[async_trait]
impl LogProgressReader for SimulatedCluster {
    async fn parse(
        &self,
        job_ids: &[String],
    ) -> Result<BTreeMap<String, ProgressRecord>, CollaboratorError> {
        if !self.profile.reachable {
            return Err(CollaboratorError::Unavailable("simulated cluster is down".into()));
        }
        let world = self.world.lock().await;

        let mut progress = BTreeMap::new();
        for job_id in job_ids {
            if let Some(job) = world.jobs.get(job_id) {
                let record = match job.phase {
                    SimPhase::Pending { .. } => ProgressRecord::pending(),
                    _ => logparse::parse_output(&Self::render_output(&self.profile, job)),
                };
                progress.insert(job_id.clone(), record);
            }
        }
        Ok(progress)
    }
}

#[async_trait]
impl ClusterExecutor for SimulatedCluster {
    async fn verify_reachable(&self) -> Result<(), CollaboratorError> {
        if self.profile.reachable {
            Ok(())
        } else {
            Err(CollaboratorError::Unavailable("simulated cluster is down".into()))
        }
    }

    async fn deploy(&self, jobs: &[JobDescriptor]) -> Result<Vec<String>, CollaboratorError> {
        self.verify_reachable().await?;
        if jobs.is_empty() {
            return Err(CollaboratorError::Rejected("empty job batch".into()));
        }

        let mut world = self.world.lock().await;
        let mut job_ids = Vec::with_capacity(jobs.len());
        for descriptor in jobs {
            let id = format!("sim-{:04}-{}", world.next_id, descriptor.benchmark);
            world.next_id += 1;
            let job = Self::spawn_job(&self.profile, &mut world.rng, descriptor.clone());
            world.jobs.insert(id.clone(), job);
            job_ids.push(id);
        }
        Ok(job_ids)
    }

    async fn extract(
        &self,
        eval_id: &str,
        job_ids: &[String],
        timing: &BTreeMap<String, TimingRecord>,
    ) -> Result<ExtractionResult, CollaboratorError> {
        self.verify_reachable().await?;
        let mut world = self.world.lock().await;

        let mut extracted = Vec::new();
        let mut failed = BTreeMap::new();
        let mut scores = serde_json::Map::new();
        for job_id in job_ids {
            let succeeded = timing
                .get(job_id)
                .map(|record| record.phase() == JobPhase::Succeeded)
                .unwrap_or(false);
            if !succeeded {
                failed.insert(job_id.clone(), "job did not succeed".to_string());
                continue;
            }
            let score: f64 = world.rng.gen_range(0.2..0.9);
            scores.insert(job_id.clone(), json!((score * 1000.0).round() / 1000.0));
            extracted.push(job_id.clone());
        }

        Ok(ExtractionResult {
            eval_id: eval_id.to_string(),
            extracted_jobs: extracted,
            failed_extractions: failed,
            summary: json!({ "scores": scores }),
        })
    }
}
