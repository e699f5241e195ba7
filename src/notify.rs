//! Notification channel shared by the monitor loop and the workflow.
//!
//! Notifiers are shared between independently ticking runs, so every
//! implementation must be safe for concurrent use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::NotifyError;

/// Where a run's notifications go. Fixed when the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub workflow_id: String,
    pub topic: String,
    pub source: String,
}

/// Fleet progress message emitted by the monitor loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaPayload {
    pub progress_percentage: f64,
    pub remaining_seconds: f64,
    pub completed_jobs: usize,
    pub total_jobs: usize,
    pub running_jobs: usize,
    pub failed_jobs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    Eta(EtaPayload),
    StageStarted {
        stage: String,
        label: String,
    },
    StageSucceeded {
        stage: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    StageFailed {
        stage: String,
        label: String,
        category: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::Eta(_) => "eta",
            NotificationEvent::StageStarted { .. } => "stage_started",
            NotificationEvent::StageSucceeded { .. } => "stage_succeeded",
            NotificationEvent::StageFailed { .. } => "stage_failed",
        }
    }
}

/// A delivered notification: event plus routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub target: NotificationTarget,
    #[serde(flatten)]
    pub event: NotificationEvent,
    pub sent_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        target: &NotificationTarget,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError>;
}

/// Forwards notifications over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { sender: tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(
        &self,
        target: &NotificationTarget,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        let notification = Notification {
            target: target.clone(),
            event: event.clone(),
            sent_at: Utc::now(),
        };
        self.sender
            .send(notification)
            .await
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        target: &NotificationTarget,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        let body = serde_json::to_string(event).map_err(|e| NotifyError::Rejected(e.to_string()))?;
        info!(
            workflow_id = %target.workflow_id,
            topic = %target.topic,
            source = %target.source,
            event = event.name(),
            "{}",
            body
        );
        Ok(())
    }
}
