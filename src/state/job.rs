//! Job status records.
//!
//! Status strings come straight from the Cluster Executor. Only `succeeded`
//! and `failed` are terminal; anything else counts as still running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a raw job status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Succeeded,
    Failed,
    Running,
}

impl JobPhase {
    pub fn classify(status: &str) -> Self {
        let status = status.trim();
        if status.eq_ignore_ascii_case("succeeded") {
            JobPhase::Succeeded
        } else if status.eq_ignore_ascii_case("failed") {
            JobPhase::Failed
        } else {
            JobPhase::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
            JobPhase::Running => "running",
        }
    }
}

/// Error detail attached to a failed job by the Cluster Executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ErrorDetails {
    /// Number of populated fields, used to pick the most informative detail
    /// among several failed jobs.
    pub fn populated_fields(&self) -> usize {
        [
            !self.category.trim().is_empty(),
            !self.error_type.trim().is_empty(),
            !self.message.trim().is_empty(),
            self.file.is_some(),
            self.line.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// `file:line` when the executor reported a source location.
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{}:{}", file, line)),
            (Some(file), None) => Some(file.clone()),
            _ => None,
        }
    }
}

/// Last known status payload for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

impl TimingRecord {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            start_time: None,
            completion_time: None,
            duration_seconds: None,
            error_details: None,
        }
    }

    pub fn phase(&self) -> JobPhase {
        JobPhase::classify(&self.status)
    }

    /// Reported duration, or the span between start and completion when the
    /// executor only sent timestamps.
    pub fn duration(&self) -> Option<f64> {
        if let Some(seconds) = self.duration_seconds {
            return Some(seconds);
        }
        match (self.start_time, self.completion_time) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}
