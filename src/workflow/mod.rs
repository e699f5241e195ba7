//! End-to-end evaluation workflow.
//!
//! A request runs through five stages in strict order; the first stage
//! failure ends the workflow. Every stage emits a start notification and
//! exactly one outcome notification to the request's target.

pub mod failure;
pub mod stages;

pub use failure::{ErrorCategory, FailureReport};
pub use stages::{MonitorDefaults, Stage, StageFailure, StageName, StageRegistry};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::cluster::{ExtractionResult, JobDescriptor};
use crate::error::WorkflowError;
use crate::monitor::{MonitorResult, DEFAULT_CALL_TIMEOUT};
use crate::notify::{NotificationEvent, NotificationTarget, Notifier};

/// What the caller wants evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub eval_id: String,
    pub model: String,
    pub benchmarks: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Data handed from stage to stage.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub request: EvaluationRequest,
    pub target: NotificationTarget,
    pub cancel: CancellationToken,
    pub descriptors: Vec<JobDescriptor>,
    pub job_ids: Vec<String>,
    pub monitor: Option<MonitorResult>,
    pub extraction: Option<ExtractionResult>,
}

impl WorkflowContext {
    pub fn new(
        request: EvaluationRequest,
        target: NotificationTarget,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            target,
            cancel,
            descriptors: Vec::new(),
            job_ids: Vec::new(),
            monitor: None,
            extraction: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub eval_id: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionResult>,
}

impl WorkflowOutcome {
    fn finish(ctx: WorkflowContext, failure: Option<(StageName, StageFailure)>) -> Self {
        let (status, failed_stage, category, message) = match failure {
            Some((stage, failure)) => (
                WorkflowStatus::Failed,
                Some(stage.as_str().to_string()),
                Some(failure.category),
                Some(failure.message),
            ),
            None => (WorkflowStatus::Succeeded, None, None, None),
        };
        Self {
            eval_id: ctx.request.eval_id,
            status,
            failed_stage,
            category,
            message,
            monitor: ctx.monitor,
            extraction: ctx.extraction,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}

pub struct OrchestrationWorkflow {
    registry: StageRegistry,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
}

impl OrchestrationWorkflow {
    pub fn new(registry: StageRegistry, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            registry,
            notifier,
            notify_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound on a single stage notification.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Runs every stage in order. Stage failures are reported in the
    /// outcome; `Err` means the workflow could not start at all.
    pub async fn run(
        &self,
        request: EvaluationRequest,
        target: NotificationTarget,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        if let Some(stage) = self.registry.missing().first() {
            return Err(WorkflowError::MissingStage(stage.as_str().to_string()));
        }

        let eval_id = request.eval_id.clone();
        let span = info_span!("workflow", eval_id = %eval_id);
        async move {
            info!(benchmarks = request.benchmarks.len(), model = %request.model, "starting evaluation");
            let mut ctx = WorkflowContext::new(request, target, cancel);

            for name in StageName::PIPELINE {
                let Some(stage) = self.registry.get(name) else {
                    return Err(WorkflowError::MissingStage(name.as_str().to_string()));
                };

                info!(stage = %name.label(), "stage started");
                self.emit(
                    &ctx.target,
                    NotificationEvent::StageStarted {
                        stage: name.as_str().to_string(),
                        label: name.label(),
                    },
                )
                .await;

                match stage.run(&mut ctx).await {
                    Ok(detail) => {
                        info!(stage = %name.label(), "stage succeeded");
                        self.emit(
                            &ctx.target,
                            NotificationEvent::StageSucceeded {
                                stage: name.as_str().to_string(),
                                label: name.label(),
                                detail,
                            },
                        )
                        .await;
                    }
                    Err(failure) => {
                        error!(
                            stage = %name.label(),
                            category = %failure.category,
                            message = %failure.message,
                            "stage failed"
                        );
                        self.emit(
                            &ctx.target,
                            NotificationEvent::StageFailed {
                                stage: name.as_str().to_string(),
                                label: name.label(),
                                category: failure.category.as_str().to_string(),
                                message: failure.message.clone(),
                                location: failure.location.clone(),
                            },
                        )
                        .await;
                        return Ok(WorkflowOutcome::finish(ctx, Some((name, failure))));
                    }
                }
            }

            info!("evaluation finished");
            Ok(WorkflowOutcome::finish(ctx, None))
        }
        .instrument(span)
        .await
    }

    async fn emit(&self, target: &NotificationTarget, event: NotificationEvent) {
        match tokio::time::timeout(self.notify_timeout, self.notifier.notify(target, &event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(event = event.name(), error = %e, "stage notification not delivered"),
            Err(_) => warn!(
                event = event.name(),
                timeout = ?self.notify_timeout,
                "stage notification timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MockNotifier;
    use async_trait::async_trait;
    use crate::error::NotifyError;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Scripted {
        name: StageName,
        result: Result<Option<String>, StageFailure>,
        calls: Arc<Mutex<Vec<StageName>>>,
    }

    #[async_trait]
    impl Stage for Scripted {
        fn name(&self) -> StageName {
            self.name
        }

        async fn run(&self, _ctx: &mut WorkflowContext) -> Result<Option<String>, StageFailure> {
            self.calls.lock().unwrap().push(self.name);
            self.result.clone()
        }
    }

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            eval_id: "eval-1".into(),
            model: "m".into(),
            benchmarks: vec!["mmlu".into()],
            params: serde_json::Value::Null,
            poll_interval_secs: None,
            max_attempts: None,
        }
    }

    fn target() -> NotificationTarget {
        NotificationTarget {
            workflow_id: "wf-1".into(),
            topic: "evaluation-progress".into(),
            source: "evalwatch".into(),
        }
    }

    fn registry(fail_at: Option<StageName>, calls: &Arc<Mutex<Vec<StageName>>>) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for name in StageName::PIPELINE {
            let result = if Some(name) == fail_at {
                Err(StageFailure::new(ErrorCategory::Network, "boom"))
            } else {
                Ok(None)
            };
            registry.register(Scripted {
                name,
                result,
                calls: Arc::clone(calls),
            });
        }
        registry
    }

    fn recording_notifier(events: &Arc<Mutex<Vec<String>>>) -> MockNotifier {
        let mut notifier = MockNotifier::new();
        let events = Arc::clone(events);
        notifier.expect_notify().returning(move |_, event| {
            let label = match event {
                NotificationEvent::StageStarted { label, .. } => format!("start {}", label),
                NotificationEvent::StageSucceeded { label, .. } => format!("ok {}", label),
                NotificationEvent::StageFailed { label, .. } => format!("fail {}", label),
                NotificationEvent::Eta(_) => "eta".to_string(),
            };
            events.lock().unwrap().push(label);
            Ok(())
        });
        notifier
    }

    #[tokio::test]
    async fn runs_all_stages_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let workflow = OrchestrationWorkflow::new(
            registry(None, &calls),
            Arc::new(recording_notifier(&events)),
        );

        let outcome = workflow
            .run(request(), target(), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(*calls.lock().unwrap(), StageName::PIPELINE.to_vec());
        assert_eq!(events.lock().unwrap().len(), 10);
        assert_eq!(events.lock().unwrap()[0], "start 1/5:verify_cluster");
        assert_eq!(events.lock().unwrap()[9], "ok 5/5:extract_results");
    }

    #[tokio::test]
    async fn first_failure_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let workflow = OrchestrationWorkflow::new(
            registry(Some(StageName::DeployJobs), &calls),
            Arc::new(recording_notifier(&events)),
        );

        let outcome = workflow
            .run(request(), target(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(outcome.failed_stage.as_deref(), Some("deploy_jobs"));
        assert_eq!(outcome.category, Some(ErrorCategory::Network));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                StageName::VerifyCluster,
                StageName::BuildJobConfiguration,
                StageName::DeployJobs
            ]
        );
        assert_eq!(
            events.lock().unwrap().last().map(String::as_str),
            Some("fail 3/5:deploy_jobs")
        );
    }

    #[tokio::test]
    async fn missing_handler_is_rejected_before_any_stage_runs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = StageRegistry::new();
        registry.register(Scripted {
            name: StageName::VerifyCluster,
            result: Ok(None),
            calls: Arc::clone(&calls),
        });
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();
        let workflow = OrchestrationWorkflow::new(registry, Arc::new(notifier));

        let err = workflow
            .run(request(), target(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, WorkflowError::MissingStage("build_job_configuration".into()));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undelivered_stage_notifications_do_not_stop_the_workflow() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(|_, _| Err(crate::error::NotifyError::ChannelClosed));
        let workflow = OrchestrationWorkflow::new(registry(None, &calls), Arc::new(notifier));

        let outcome = workflow
            .run(request(), target(), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.succeeded());
    }

    /// Accepts nothing and never returns, like a consumer that stopped reading.
    struct StalledNotifier;

    #[async_trait]
    impl Notifier for StalledNotifier {
        async fn notify(
            &self,
            _target: &NotificationTarget,
            _event: &NotificationEvent,
        ) -> Result<(), NotifyError> {
            std::future::pending::<Result<(), NotifyError>>().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_notification_channel_is_bounded() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let workflow = OrchestrationWorkflow::new(registry(None, &calls), Arc::new(StalledNotifier))
            .with_notify_timeout(Duration::from_secs(2));

        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            workflow.run(request(), target(), CancellationToken::new()),
        )
        .await
        .expect("workflow hung on a stalled notifier")
        .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(*calls.lock().unwrap(), StageName::PIPELINE.to_vec());
    }
}
