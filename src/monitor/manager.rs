//! Concurrent monitoring runs.
//!
//! Every run is an independent tokio task with its own cancellation token;
//! runs share nothing but the collaborators behind the `MonitorLoop`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{MonitorLoop, MonitorRequest, MonitorResult};
use crate::store::StateStore;

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<MonitorResult>,
}

impl RunHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct MonitorManager {
    monitor: Arc<MonitorLoop>,
    store: Arc<dyn StateStore>,
    runs: Mutex<HashMap<String, RunHandle>>,
}

impl MonitorManager {
    pub fn new(monitor: Arc<MonitorLoop>, store: Arc<dyn StateStore>) -> Self {
        Self {
            monitor,
            store,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a run and returns its ID. Starting a batch that is already
    /// being monitored returns the existing run; a finished run of the same
    /// batch is replaced by a new one.
    pub async fn start(&self, request: MonitorRequest) -> String {
        let run_id = request.run_id();
        let mut runs = self.runs.lock().await;
        if runs.get(&run_id).is_some_and(RunHandle::is_live) {
            info!(run_id = %run_id, "monitor run already active");
            return run_id;
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(&self.monitor);
        let token = cancel.clone();
        let task = tokio::spawn(async move { monitor.run(request, token).await });
        runs.insert(run_id.clone(), RunHandle { cancel, task });
        run_id
    }

    /// Re-drives every run with persisted state. Returns the resumed IDs.
    pub async fn resume_all(&self) -> Vec<String> {
        let persisted = match self.store.list().await {
            Ok(run_ids) => run_ids,
            Err(e) => {
                error!(error = %e, "cannot list persisted monitor runs");
                return Vec::new();
            }
        };

        let mut runs = self.runs.lock().await;
        let mut resumed = Vec::new();
        for run_id in persisted {
            if runs.get(&run_id).is_some_and(RunHandle::is_live) {
                continue;
            }
            let cancel = CancellationToken::new();
            let monitor = Arc::clone(&self.monitor);
            let token = cancel.clone();
            let id = run_id.clone();
            let task = tokio::spawn(async move {
                match monitor.resume(&id, token).await {
                    Some(result) => result,
                    None => {
                        warn!(run_id = %id, "persisted state vanished before resume");
                        MonitorResult {
                            run_id: id,
                            status: super::MonitorStatus::Error,
                            completed_jobs: Vec::new(),
                            failed_jobs: Vec::new(),
                            job_details: Default::default(),
                            job_progress: Default::default(),
                            attempts: 0,
                            error: Some("persisted state missing".into()),
                        }
                    }
                }
            });
            runs.insert(run_id.clone(), RunHandle { cancel, task });
            resumed.push(run_id);
        }
        info!(count = resumed.len(), "resumed persisted monitor runs");
        resumed
    }

    /// Requests cancellation; the run stops at the top of its next tick.
    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.runs.lock().await.get(run_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        for handle in self.runs.lock().await.values() {
            handle.cancel.cancel();
        }
    }

    /// Waits for a run to finish and forgets it. A finished run stays
    /// joinable until it is joined or replaced by a restart.
    pub async fn join(&self, run_id: &str) -> Option<MonitorResult> {
        let handle = self.runs.lock().await.remove(run_id)?;
        match handle.task.await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(run_id, error = %e, "monitor task aborted");
                None
            }
        }
    }

    /// Runs still ticking.
    pub async fn active_runs(&self) -> Vec<String> {
        let mut run_ids: Vec<String> = self
            .runs
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| handle.is_live())
            .map(|(run_id, _)| run_id.clone())
            .collect();
        run_ids.sort();
        run_ids
    }
}
