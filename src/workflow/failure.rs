//! User-facing failure categories.
//!
//! When every job of an evaluation fails, the most informative per-job
//! error detail is turned into one categorized report.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::monitor::MonitorResult;
use crate::state::{ErrorDetails, TimingRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DatasetMissing,
    OutOfMemory,
    Configuration,
    Network,
    Timeout,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DatasetMissing => "dataset_missing",
            ErrorCategory::OutOfMemory => "out_of_memory",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Recognises a category name reported by the executor.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "dataset_missing" | "dataset_not_found" | "missing_dataset" => {
                Some(ErrorCategory::DatasetMissing)
            }
            "out_of_memory" | "oom" | "memory" => Some(ErrorCategory::OutOfMemory),
            "configuration" | "config" | "invalid_config" => Some(ErrorCategory::Configuration),
            "network" | "connection" => Some(ErrorCategory::Network),
            "timeout" => Some(ErrorCategory::Timeout),
            _ => None,
        }
    }

    /// Guesses a category from the exception type and message.
    pub fn infer(error_type: &str, message: &str) -> Self {
        let haystack = format!("{} {}", error_type, message).to_ascii_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|needle| haystack.contains(needle));

        if any(&["out of memory", "outofmemory", "oom", "memoryerror"]) {
            ErrorCategory::OutOfMemory
        } else if any(&["filenotfounderror", "datasetnotfound", "no such file"])
            || (haystack.contains("dataset") && any(&["not found", "missing", "doesn't exist"]))
        {
            ErrorCategory::DatasetMissing
        } else if any(&["connectionerror", "connection", "network", "timed out", "unreachable", "dns"]) {
            ErrorCategory::Network
        } else if any(&["valueerror", "keyerror", "config", "invalid", "unknown task"]) {
            ErrorCategory::Configuration
        } else {
            ErrorCategory::Unknown
        }
    }

    pub fn from_details(details: &ErrorDetails) -> Self {
        Self::parse(&details.category)
            .unwrap_or_else(|| Self::infer(&details.error_type, &details.message))
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&CollaboratorError> for ErrorCategory {
    fn from(error: &CollaboratorError) -> Self {
        match error {
            CollaboratorError::Unavailable(_) => ErrorCategory::Network,
            CollaboratorError::Timeout(_) => ErrorCategory::Timeout,
            CollaboratorError::Rejected(_) => ErrorCategory::Configuration,
            CollaboratorError::Malformed(_) => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

fn richness(details: &ErrorDetails) -> usize {
    let recognised = ErrorCategory::parse(&details.category).is_some() as usize;
    details.populated_fields() + recognised
}

/// The failed job whose error detail carries the most information. Ties go
/// to the lowest job ID.
pub fn richest_error<'a>(
    timing: &'a BTreeMap<String, TimingRecord>,
    failed_jobs: &[String],
) -> Option<(&'a str, &'a ErrorDetails)> {
    let mut best: Option<(&str, &ErrorDetails, usize)> = None;
    for (job_id, record) in timing {
        if !failed_jobs.iter().any(|failed| failed == job_id) {
            continue;
        }
        let Some(details) = record.error_details.as_ref() else {
            continue;
        };
        let score = richness(details);
        if best.map_or(true, |(_, _, top)| score > top) {
            best = Some((job_id.as_str(), details, score));
        }
    }
    best.map(|(job_id, details, _)| (job_id, details))
}

/// Report for a run that completed with zero successful jobs.
pub fn total_failure_report(result: &MonitorResult) -> FailureReport {
    let total = result.failed_jobs.len();
    match richest_error(&result.job_details, &result.failed_jobs) {
        Some((job_id, details)) => {
            let summary = match (details.error_type.trim(), details.message.trim()) {
                ("", "") => "no error message".to_string(),
                ("", message) => message.to_string(),
                (error_type, "") => error_type.to_string(),
                (error_type, message) => format!("{}: {}", error_type, message),
            };
            FailureReport {
                category: ErrorCategory::from_details(details),
                message: format!("all {} jobs failed; {}", total, summary),
                location: details.location(),
                job_id: Some(job_id.to_string()),
            }
        }
        None => FailureReport {
            category: ErrorCategory::Unknown,
            message: format!("all {} jobs failed without error details", total),
            location: None,
            job_id: None,
        },
    }
}
