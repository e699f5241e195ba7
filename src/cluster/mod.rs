//! Contracts over the Cluster Executor.
//!
//! The engine never talks to the compute cluster directly. Status polling,
//! log scraping, deployment and result extraction all go through these
//! traits, which must be safe to call concurrently from independent runs:
//!
//! - [`StatusPoller`] reports each job's latest status payload
//! - [`LogProgressReader`] reports progress scraped from live output
//! - [`ClusterExecutor`] deploys job batches and extracts results

pub mod logparse;
pub mod simulated;

pub use simulated::{SimulatedCluster, SimulationProfile};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::state::{ProgressRecord, TimingRecord};

/// Opaque description of one job handed to the executor for deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub benchmark: String,
    pub model: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub eval_id: String,
    pub extracted_jobs: Vec<String>,
    #[serde(default)]
    pub failed_extractions: BTreeMap<String, String>,
    #[serde(default)]
    pub summary: serde_json::Value,
}

impl ExtractionResult {
    /// Nothing was extracted even though something was attempted.
    pub fn is_failure(&self) -> bool {
        self.extracted_jobs.is_empty() && !self.failed_extractions.is_empty()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusPoller: Send + Sync {
    /// Latest status payload per job. Jobs the executor knows nothing about
    /// yet are simply absent.
    async fn poll(
        &self,
        job_ids: &[String],
    ) -> Result<BTreeMap<String, TimingRecord>, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogProgressReader: Send + Sync {
    async fn parse(
        &self,
        job_ids: &[String],
    ) -> Result<BTreeMap<String, ProgressRecord>, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    async fn verify_reachable(&self) -> Result<(), CollaboratorError>;

    /// Submits the batch and returns one job ID per descriptor.
    async fn deploy(&self, jobs: &[JobDescriptor]) -> Result<Vec<String>, CollaboratorError>;

    async fn extract(
        &self,
        eval_id: &str,
        job_ids: &[String],
        timing: &BTreeMap<String, TimingRecord>,
    ) -> Result<ExtractionResult, CollaboratorError>;
}

/// The three executor contracts, shared between runs.
#[derive(Clone)]
pub struct ClusterHandles {
    pub poller: Arc<dyn StatusPoller>,
    pub reader: Arc<dyn LogProgressReader>,
    pub executor: Arc<dyn ClusterExecutor>,
}

impl ClusterHandles {
    /// Uses one value for all three contracts.
    pub fn from_shared<T>(cluster: Arc<T>) -> Self
    where
        T: StatusPoller + LogProgressReader + ClusterExecutor + 'static,
    {
        Self {
            poller: cluster.clone(),
            reader: cluster.clone(),
            executor: cluster,
        }
    }
}
