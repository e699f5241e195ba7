//! The five orchestration stages and their dispatch table.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, info, warn};

use super::failure::{total_failure_report, ErrorCategory};
use super::WorkflowContext;
use crate::cluster::{ClusterExecutor, JobDescriptor};
use crate::error::CollaboratorError;
use crate::monitor::{MonitorLoop, MonitorRequest, MonitorStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageName {
    VerifyCluster,
    BuildJobConfiguration,
    DeployJobs,
    MonitorJobs,
    ExtractResults,
}

impl StageName {
    /// Execution order.
    pub const PIPELINE: [StageName; 5] = [
        StageName::VerifyCluster,
        StageName::BuildJobConfiguration,
        StageName::DeployJobs,
        StageName::MonitorJobs,
        StageName::ExtractResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::VerifyCluster => "verify_cluster",
            StageName::BuildJobConfiguration => "build_job_configuration",
            StageName::DeployJobs => "deploy_jobs",
            StageName::MonitorJobs => "monitor_jobs",
            StageName::ExtractResults => "extract_results",
        }
    }

    /// 1-based position in [`StageName::PIPELINE`].
    pub fn position(&self) -> usize {
        Self::PIPELINE
            .iter()
            .position(|stage| stage == self)
            .map_or(0, |index| index + 1)
    }

    /// Progress label, e.g. `3/5:deploy_jobs`.
    pub fn label(&self) -> String {
        format!("{}/{}:{}", self.position(), Self::PIPELINE.len(), self.as_str())
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage stopped the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub location: Option<String>,
}

impl StageFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            location: None,
        }
    }

    pub fn from_collaborator(action: &str, error: &CollaboratorError) -> Self {
        Self::new(ErrorCategory::from(error), format!("{}: {}", action, error))
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Runs the stage against the shared context. `Ok` carries an optional
    /// one-line detail for the success notification.
    async fn run(&self, ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure>;
}

/// Explicit stage name to handler table.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<StageName, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production pipeline over one executor and monitor loop.
    pub fn standard(
        executor: Arc<dyn ClusterExecutor>,
        monitor: Arc<MonitorLoop>,
        defaults: MonitorDefaults,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(VerifyClusterStage::new(executor.clone(), defaults.call_timeout));
        registry.register(BuildJobConfigurationStage);
        registry.register(DeployJobsStage::new(executor.clone(), defaults.call_timeout));
        registry.register(MonitorJobsStage::new(monitor, defaults));
        registry.register(ExtractResultsStage::new(executor, defaults.call_timeout));
        registry
    }

    /// Installs a handler, replacing any previous one for the same stage.
    pub fn register(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.stages.insert(stage.name(), Arc::new(stage));
        self
    }

    pub fn get(&self, name: StageName) -> Option<Arc<dyn Stage>> {
        self.stages.get(&name).cloned()
    }

    /// Pipeline stages without a handler.
    pub fn missing(&self) -> Vec<StageName> {
        StageName::PIPELINE
            .into_iter()
            .filter(|name| !self.stages.contains_key(name))
            .collect()
    }
}

/// Monitoring settings used when a request does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorDefaults {
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub call_timeout: Duration,
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CollaboratorError>>,
) -> Result<T, CollaboratorError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout(limit)),
    }
}

pub struct VerifyClusterStage {
    executor: Arc<dyn ClusterExecutor>,
    call_timeout: Duration,
}

impl VerifyClusterStage {
    pub fn new(executor: Arc<dyn ClusterExecutor>, call_timeout: Duration) -> Self {
        Self {
            executor,
            call_timeout,
        }
    }
}

#[async_trait]
impl Stage for VerifyClusterStage {
    fn name(&self) -> StageName {
        StageName::VerifyCluster
    }

    async fn run(&self, _ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure> {
        bounded(self.call_timeout, self.executor.verify_reachable())
            .await
            .map_err(|e| StageFailure::from_collaborator("cluster unreachable", &e))?;
        Ok(None)
    }
}

/// Turns the request into one job descriptor per benchmark.
pub struct BuildJobConfigurationStage;

#[async_trait]
impl Stage for BuildJobConfigurationStage {
    fn name(&self) -> StageName {
        StageName::BuildJobConfiguration
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure> {
        let request = &ctx.request;
        if request.model.trim().is_empty() {
            return Err(StageFailure::new(ErrorCategory::Configuration, "no model given"));
        }
        if request.benchmarks.is_empty() {
            return Err(StageFailure::new(ErrorCategory::Configuration, "no benchmarks requested"));
        }
        let duplicates: Vec<&String> = request.benchmarks.iter().duplicates().collect();
        if !duplicates.is_empty() {
            return Err(StageFailure::new(
                ErrorCategory::Configuration,
                format!("benchmarks requested more than once: {}", duplicates.iter().join(", ")),
            ));
        }

        ctx.descriptors = request
            .benchmarks
            .iter()
            .map(|benchmark| JobDescriptor {
                name: format!("{}-{}", request.eval_id, benchmark),
                benchmark: benchmark.clone(),
                model: request.model.clone(),
                params: request.params.clone(),
            })
            .collect();
        debug!(eval_id = %request.eval_id, jobs = ctx.descriptors.len(), "built job configuration");
        Ok(Some(format!("{} jobs", ctx.descriptors.len())))
    }
}

pub struct DeployJobsStage {
    executor: Arc<dyn ClusterExecutor>,
    call_timeout: Duration,
}

impl DeployJobsStage {
    pub fn new(executor: Arc<dyn ClusterExecutor>, call_timeout: Duration) -> Self {
        Self {
            executor,
            call_timeout,
        }
    }
}

#[async_trait]
impl Stage for DeployJobsStage {
    fn name(&self) -> StageName {
        StageName::DeployJobs
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure> {
        let job_ids = bounded(self.call_timeout, self.executor.deploy(&ctx.descriptors))
            .await
            .map_err(|e| StageFailure::from_collaborator("deployment failed", &e))?;
        if job_ids.is_empty() {
            return Err(StageFailure::new(
                ErrorCategory::Unknown,
                "executor accepted the batch but returned no job IDs",
            ));
        }
        if job_ids.len() != ctx.descriptors.len() {
            warn!(
                eval_id = %ctx.request.eval_id,
                requested = ctx.descriptors.len(),
                deployed = job_ids.len(),
                "executor deployed a different number of jobs than requested"
            );
        }
        info!(eval_id = %ctx.request.eval_id, jobs = job_ids.len(), "deployed jobs");
        let detail = job_ids.iter().join(", ");
        ctx.job_ids = job_ids;
        Ok(Some(detail))
    }
}

/// Hands the deployed batch to the monitor loop and waits for its outcome.
pub struct MonitorJobsStage {
    monitor: Arc<MonitorLoop>,
    defaults: MonitorDefaults,
}

impl MonitorJobsStage {
    pub fn new(monitor: Arc<MonitorLoop>, defaults: MonitorDefaults) -> Self {
        Self { monitor, defaults }
    }
}

#[async_trait]
impl Stage for MonitorJobsStage {
    fn name(&self) -> StageName {
        StageName::MonitorJobs
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure> {
        let request = MonitorRequest {
            run_id: Some(ctx.request.eval_id.clone()),
            job_ids: ctx.job_ids.clone(),
            poll_interval_seconds: ctx
                .request
                .poll_interval_secs
                .unwrap_or(self.defaults.poll_interval_secs),
            max_attempts: ctx.request.max_attempts.unwrap_or(self.defaults.max_attempts),
            notification_target: ctx.target.clone(),
        };
        let result = self.monitor.run(request, ctx.cancel.clone()).await;
        let remaining = ctx
            .job_ids
            .len()
            .saturating_sub(result.completed_jobs.len() + result.failed_jobs.len());

        let outcome = match result.status {
            MonitorStatus::Completed if result.is_total_failure() => {
                let report = total_failure_report(&result);
                Err(StageFailure {
                    category: report.category,
                    message: report.message,
                    location: report.location,
                })
            }
            MonitorStatus::Completed => Ok(Some(format!(
                "{} succeeded, {} failed after {} attempts",
                result.completed_jobs.len(),
                result.failed_jobs.len(),
                result.attempts
            ))),
            MonitorStatus::Timeout => Err(StageFailure::new(
                ErrorCategory::Timeout,
                format!(
                    "monitoring gave up after {} attempts with {} jobs unfinished",
                    result.attempts, remaining
                ),
            )),
            MonitorStatus::Error => Err(StageFailure::new(
                ErrorCategory::Network,
                format!(
                    "monitoring failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            )),
            MonitorStatus::Cancelled => Err(StageFailure::new(
                ErrorCategory::Cancelled,
                format!("monitoring cancelled after {} attempts", result.attempts),
            )),
        };
        ctx.monitor = Some(result);
        outcome
    }
}

pub struct ExtractResultsStage {
    executor: Arc<dyn ClusterExecutor>,
    call_timeout: Duration,
}

impl ExtractResultsStage {
    pub fn new(executor: Arc<dyn ClusterExecutor>, call_timeout: Duration) -> Self {
        Self {
            executor,
            call_timeout,
        }
    }
}

#[async_trait]
impl Stage for ExtractResultsStage {
    fn name(&self) -> StageName {
        StageName::ExtractResults
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure> {
        let Some(monitor) = ctx.monitor.as_ref() else {
            return Err(StageFailure::new(
                ErrorCategory::Unknown,
                "no monitoring result to extract from",
            ));
        };
        let extraction = bounded(
            self.call_timeout,
            self.executor.extract(
                &ctx.request.eval_id,
                &monitor.completed_jobs,
                &monitor.job_details,
            ),
        )
        .await
        .map_err(|e| StageFailure::from_collaborator("result extraction failed", &e))?;

        let failed = extraction.failed_extractions.len();
        let detail = format!(
            "{} extracted, {} failed",
            extraction.extracted_jobs.len(),
            failed
        );
        let outcome = if extraction.is_failure() {
            let reasons = extraction
                .failed_extractions
                .iter()
                .map(|(job, reason)| format!("{}: {}", job, reason))
                .join("; ");
            Err(StageFailure::new(
                ErrorCategory::Unknown,
                format!("no results could be extracted ({})", reasons),
            ))
        } else {
            if failed > 0 {
                warn!(eval_id = %ctx.request.eval_id, failed, "some results could not be extracted");
            }
            Ok(Some(detail))
        };
        ctx.extraction = Some(extraction);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterExecutor;
    use crate::notify::NotificationTarget;
    use crate::workflow::EvaluationRequest;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    fn context(benchmarks: &[&str]) -> WorkflowContext {
        let request = EvaluationRequest {
            eval_id: "eval-7".into(),
            model: "llama-3-8b".into(),
            benchmarks: benchmarks.iter().map(|b| b.to_string()).collect(),
            params: serde_json::json!({ "shots": 5 }),
            poll_interval_secs: None,
            max_attempts: None,
        };
        WorkflowContext::new(
            request,
            NotificationTarget {
                workflow_id: "wf".into(),
                topic: "t".into(),
                source: "s".into(),
            },
            CancellationToken::new(),
        )
    }

    #[rstest]
    #[case(StageName::VerifyCluster, "1/5:verify_cluster")]
    #[case(StageName::DeployJobs, "3/5:deploy_jobs")]
    #[case(StageName::ExtractResults, "5/5:extract_results")]
    fn labels_carry_position(#[case] stage: StageName, #[case] label: &str) {
        assert_eq!(stage.label(), label);
    }

    #[tokio::test]
    async fn builds_one_descriptor_per_benchmark() {
        let mut ctx = context(&["mmlu", "arc"]);
        let detail = BuildJobConfigurationStage.run(&mut ctx).await.unwrap();

        assert_eq!(detail.as_deref(), Some("2 jobs"));
        let names: Vec<&str> = ctx.descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["eval-7-mmlu", "eval-7-arc"]);
        assert_eq!(ctx.descriptors[0].params["shots"], 5);
    }

    #[rstest]
    #[case(&[])]
    #[case(&["mmlu", "mmlu"])]
    #[tokio::test]
    async fn rejects_bad_benchmark_lists(#[case] benchmarks: &[&str]) {
        let mut ctx = context(benchmarks);
        let failure = BuildJobConfigurationStage.run(&mut ctx).await.unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn unreachable_cluster_is_a_network_failure() {
        let mut executor = MockClusterExecutor::new();
        executor
            .expect_verify_reachable()
            .returning(|| Err(CollaboratorError::Unavailable("no route to head node".into())));
        let stage = VerifyClusterStage::new(Arc::new(executor), Duration::from_secs(1));

        let failure = stage.run(&mut context(&["mmlu"])).await.unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Network);
        assert!(failure.message.contains("no route to head node"));
    }

    #[tokio::test]
    async fn deploy_records_job_ids() {
        let mut executor = MockClusterExecutor::new();
        executor
            .expect_deploy()
            .returning(|jobs| Ok(jobs.iter().map(|j| format!("job-{}", j.benchmark)).collect()));
        let stage = DeployJobsStage::new(Arc::new(executor), Duration::from_secs(1));

        let mut ctx = context(&["mmlu", "arc"]);
        BuildJobConfigurationStage.run(&mut ctx).await.unwrap();
        let detail = stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.job_ids, vec!["job-mmlu".to_string(), "job-arc".to_string()]);
        assert_eq!(detail.as_deref(), Some("job-mmlu, job-arc"));
    }

    #[test]
    fn registry_reports_missing_stages() {
        let mut registry = StageRegistry::new();
        registry.register(BuildJobConfigurationStage);
        assert_eq!(
            registry.missing(),
            vec![
                StageName::VerifyCluster,
                StageName::DeployJobs,
                StageName::MonitorJobs,
                StageName::ExtractResults
            ]
        );
        assert!(registry.get(StageName::BuildJobConfiguration).is_some());
    }
}
