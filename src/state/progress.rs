//! Progress records scraped from live job output, and the fleet-level
//! aggregate derived from them.

use serde::{Deserialize, Serialize};

/// Lifecycle phase reported alongside a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Resources not ready yet; the job has not produced output.
    Pending,
    Running,
    NoLogs,
}

/// Whole-run estimate derived from the progress bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaData {
    pub total_eta_seconds: f64,
    pub total_batches: u64,
    pub speed_per_batch: f64,
}

/// Most recent progress line seen in the job output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestProgress {
    pub remaining_seconds: f64,
    pub batches_completed: u64,
    pub batches_total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_data: Option<EtaData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_progress: Option<LatestProgress>,
    #[serde(default)]
    pub progress_percentage: f64,
}

impl ProgressRecord {
    pub fn pending() -> Self {
        Self {
            status: ProgressStatus::Pending,
            eta_data: None,
            latest_progress: None,
            progress_percentage: 0.0,
        }
    }

    pub fn no_logs() -> Self {
        Self {
            status: ProgressStatus::NoLogs,
            eta_data: None,
            latest_progress: None,
            progress_percentage: 0.0,
        }
    }

    /// Running record without any parsed progress bar yet.
    pub fn started() -> Self {
        Self {
            status: ProgressStatus::Running,
            eta_data: None,
            latest_progress: None,
            progress_percentage: 0.0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProgressStatus::Pending
    }

    /// Seconds left for this job, if it reported an estimate. Pending jobs
    /// never contribute one.
    pub fn remaining_estimate(&self) -> Option<f64> {
        if self.is_pending() {
            return None;
        }
        self.latest_progress
            .as_ref()
            .map(|latest| latest.remaining_seconds)
            .or_else(|| self.eta_data.as_ref().map(|eta| eta.total_eta_seconds))
    }
}

/// Fleet-level summary across the jobs still running.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FleetProgress {
    /// Mean percentage over non-pending jobs.
    pub avg_progress: f64,
    /// Slowest job's remaining seconds; the caller waits for the last job.
    pub worst_remaining_seconds: f64,
    /// Non-pending jobs that fed `avg_progress`.
    pub reporting_jobs: usize,
}

impl FleetProgress {
    pub fn aggregate<'a>(records: impl IntoIterator<Item = &'a ProgressRecord>) -> Self {
        let mut total = 0.0;
        let mut reporting = 0usize;
        let mut worst: f64 = 0.0;

        for record in records {
            if record.is_pending() {
                continue;
            }
            total += record.progress_percentage;
            reporting += 1;
            if let Some(remaining) = record.remaining_estimate() {
                worst = worst.max(remaining);
            }
        }

        Self {
            avg_progress: if reporting == 0 {
                0.0
            } else {
                total / reporting as f64
            },
            worst_remaining_seconds: worst,
            reporting_jobs: reporting,
        }
    }

    pub fn remaining_minutes(&self) -> u64 {
        (self.worst_remaining_seconds / 60.0).floor().max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(percentage: f64, remaining: f64) -> ProgressRecord {
        ProgressRecord {
            status: ProgressStatus::Running,
            eta_data: None,
            latest_progress: Some(LatestProgress {
                remaining_seconds: remaining,
                batches_completed: percentage as u64,
                batches_total: 100,
            }),
            progress_percentage: percentage,
        }
    }

    #[test]
    fn pending_jobs_are_excluded_from_aggregate() {
        let records = vec![ProgressRecord::pending(), running(40.0, 600.0), running(60.0, 120.0)];
        let fleet = FleetProgress::aggregate(&records);
        assert_eq!(fleet.avg_progress, 50.0);
        assert_eq!(fleet.worst_remaining_seconds, 600.0);
        assert_eq!(fleet.reporting_jobs, 2);
        assert_eq!(fleet.remaining_minutes(), 10);
    }

    #[test]
    fn all_pending_aggregates_to_zero() {
        let records = vec![ProgressRecord::pending(); 3];
        assert_eq!(FleetProgress::aggregate(&records), FleetProgress::default());
    }

    #[test]
    fn no_logs_counts_as_zero_progress() {
        let records = vec![ProgressRecord::no_logs(), running(30.0, 59.0)];
        let fleet = FleetProgress::aggregate(&records);
        assert_eq!(fleet.avg_progress, 15.0);
        assert_eq!(fleet.remaining_minutes(), 0);
    }

    #[test]
    fn eta_is_used_when_no_latest_progress() {
        let record = ProgressRecord {
            status: ProgressStatus::Running,
            eta_data: Some(EtaData {
                total_eta_seconds: 300.0,
                total_batches: 10,
                speed_per_batch: 30.0,
            }),
            latest_progress: None,
            progress_percentage: 0.0,
        };
        assert_eq!(record.remaining_estimate(), Some(300.0));
        assert_eq!(ProgressRecord::pending().remaining_estimate(), None);
    }
}
