//! Application wiring.
//!
//! Connects configuration, the Cluster Executor, persistence and the
//! notification channel to the workflow and the monitor manager.

use std::sync::Arc;

use color_eyre::Result;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::ClusterHandles;
use crate::config::OrchestratorConfig;
use crate::monitor::{MonitorLoop, MonitorManager, MonitorResult};
use crate::notify::Notifier;
use crate::store::StateStore;
use crate::workflow::{EvaluationRequest, OrchestrationWorkflow, StageRegistry, WorkflowOutcome};

pub struct App {
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    monitor: Arc<MonitorLoop>,
    workflow: OrchestrationWorkflow,
}

impl App {
    pub fn new(
        config: OrchestratorConfig,
        cluster: ClusterHandles,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate().wrap_err("refusing to start with invalid configuration")?;

        let monitor = Arc::new(MonitorLoop::from_cluster(
            &cluster,
            Arc::clone(&notifier),
            Arc::clone(&store),
            config.call_timeout(),
        ));
        let registry = StageRegistry::standard(
            Arc::clone(&cluster.executor),
            Arc::clone(&monitor),
            config.monitor_defaults(),
        );
        let workflow = OrchestrationWorkflow::new(registry, notifier)
            .with_notify_timeout(config.call_timeout());

        Ok(Self {
            config,
            store,
            monitor,
            workflow,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs one evaluation end to end. Notifications are routed to a
    /// workflow named after the evaluation.
    pub async fn evaluate(
        &self,
        request: EvaluationRequest,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome> {
        let target = self.config.notification_target(request.eval_id.clone());
        let outcome = self
            .workflow
            .run(request, target, cancel)
            .await
            .wrap_err("evaluation workflow could not run")?;
        Ok(outcome)
    }

    /// Re-drives every persisted monitoring run until each one finishes or
    /// `cancel` fires.
    pub async fn resume(&self, cancel: CancellationToken) -> Result<Vec<MonitorResult>> {
        let manager = Arc::new(MonitorManager::new(
            Arc::clone(&self.monitor),
            Arc::clone(&self.store),
        ));
        let run_ids = manager.resume_all().await;

        let watcher = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                cancel.cancelled().await;
                manager.cancel_all().await;
            })
        };

        let mut results = Vec::with_capacity(run_ids.len());
        for run_id in &run_ids {
            if let Some(result) = manager.join(run_id).await {
                info!(run_id = %result.run_id, status = result.status.as_str(), "resumed run finished");
                results.push(result);
            }
        }
        watcher.abort();
        Ok(results)
    }
}
