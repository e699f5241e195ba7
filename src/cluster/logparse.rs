//! Progress scraping from live job output.
//!
//! Evaluation harnesses print tqdm-style progress bars such as
//!
//! ```text
//! Running loglikelihood requests:  45%|████▌     | 450/1000 [02:10<02:39,  3.45it/s]
//! ```
//!
//! Bars are redrawn with carriage returns, so output is split on both `\r`
//! and `\n` and the last parseable bar wins.

use crate::state::{EtaData, LatestProgress, ProgressRecord, ProgressStatus};

/// Fields recovered from a single progress bar.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressBar {
    pub completed: u64,
    pub total: u64,
    pub elapsed_seconds: Option<f64>,
    pub remaining_seconds: Option<f64>,
    pub seconds_per_batch: Option<f64>,
}

impl ProgressBar {
    pub fn percentage(&self) -> f64 {
        (self.completed as f64 * 100.0 / self.total as f64).min(100.0)
    }

    /// Remaining seconds as printed, or extrapolated from the rate.
    pub fn remaining(&self) -> Option<f64> {
        self.remaining_seconds.or_else(|| {
            self.seconds_per_batch
                .map(|speed| self.total.saturating_sub(self.completed) as f64 * speed)
        })
    }

    pub fn into_record(self) -> ProgressRecord {
        let eta_data = self.seconds_per_batch.map(|speed| EtaData {
            total_eta_seconds: self.total as f64 * speed,
            total_batches: self.total,
            speed_per_batch: speed,
        });
        let latest_progress = self.remaining().map(|remaining| LatestProgress {
            remaining_seconds: remaining,
            batches_completed: self.completed,
            batches_total: self.total,
        });
        ProgressRecord {
            status: ProgressStatus::Running,
            progress_percentage: self.percentage(),
            eta_data,
            latest_progress,
        }
    }
}

/// Turns a job's captured output into a progress record.
pub fn parse_output(output: &str) -> ProgressRecord {
    if output.trim().is_empty() {
        return ProgressRecord::no_logs();
    }
    output
        .split(|c| c == '\n' || c == '\r')
        .filter_map(parse_bar)
        .last()
        .map(ProgressBar::into_record)
        .unwrap_or_else(ProgressRecord::started)
}

/// Parses one tqdm line: `... | 450/1000 [02:10<02:39,  3.45it/s]`.
pub fn parse_bar(line: &str) -> Option<ProgressBar> {
    let (head, tail) = line.rsplit_once('[')?;

    let counts = head
        .trim_end()
        .rsplit(|c: char| c.is_whitespace() || c == '|')
        .find(|token| !token.is_empty())?;
    let (done, total) = counts.split_once('/')?;
    let completed: u64 = done.trim().parse().ok()?;
    let total: u64 = total.trim().parse().ok()?;
    if total == 0 {
        return None;
    }

    let inner = tail.split_once(']')?.0;
    let (clocks, rate) = match inner.split_once(',') {
        Some((clocks, rate)) => (clocks, Some(rate)),
        None => (inner, None),
    };
    let (elapsed, remaining) = match clocks.split_once('<') {
        Some((elapsed, remaining)) => (parse_clock(elapsed), parse_clock(remaining)),
        None => (parse_clock(clocks), None),
    };

    Some(ProgressBar {
        completed,
        total,
        elapsed_seconds: elapsed,
        remaining_seconds: remaining,
        seconds_per_batch: rate.and_then(parse_rate),
    })
}

/// `SS`, `MM:SS` or `H:MM:SS`; `?` and garbage yield `None`.
fn parse_clock(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut seconds = 0u64;
    for part in raw.split(':') {
        let value: u64 = part.parse().ok()?;
        seconds = seconds * 60 + value;
    }
    Some(seconds as f64)
}

/// `3.45it/s` or `1.20s/it`, normalized to seconds per batch.
fn parse_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(value) = raw.strip_suffix("it/s") {
        let per_second: f64 = value.trim().parse().ok()?;
        (per_second > 0.0).then(|| 1.0 / per_second)
    } else if let Some(value) = raw.strip_suffix("s/it") {
        let seconds: f64 = value.trim().parse().ok()?;
        (seconds >= 0.0).then_some(seconds)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_standard_tqdm_bar() {
        let bar = parse_bar(
            "Running loglikelihood requests:  45%|████▌     | 450/1000 [02:10<02:39,  4.00it/s]",
        )
        .unwrap();
        assert_eq!(bar.completed, 450);
        assert_eq!(bar.total, 1000);
        assert_eq!(bar.elapsed_seconds, Some(130.0));
        assert_eq!(bar.remaining_seconds, Some(159.0));
        assert_eq!(bar.seconds_per_batch, Some(0.25));
        assert_eq!(bar.percentage(), 45.0);
    }

    #[rstest]
    #[case("2/10 [00:30<1:02:00, 15.00s/it]", Some(3720.0), Some(15.0))]
    #[case("2/10 [00:30<?, ?it/s]", None, None)]
    #[case("5/10 [00:05]", None, None)]
    fn parses_bar_variants(
        #[case] line: &str,
        #[case] remaining: Option<f64>,
        #[case] speed: Option<f64>,
    ) {
        let bar = parse_bar(line).unwrap();
        assert_eq!(bar.remaining_seconds, remaining);
        assert_eq!(bar.seconds_per_batch, speed);
    }

    #[rstest]
    #[case("Loading model weights")]
    #[case("0/0 [00:00<?, ?it/s]")]
    #[case("[INFO] starting")]
    fn rejects_non_progress_lines(#[case] line: &str) {
        assert!(parse_bar(line).is_none());
    }

    #[test]
    fn last_bar_wins_across_carriage_returns() {
        let output = "Loading\n 10%| | 10/100 [00:10<01:30, 1.00it/s]\r 20%| | 20/100 [00:20<01:20, 1.00it/s]\n";
        let record = parse_output(output);
        assert_eq!(record.status, ProgressStatus::Running);
        assert_eq!(record.progress_percentage, 20.0);
        let latest = record.latest_progress.unwrap();
        assert_eq!(latest.remaining_seconds, 80.0);
        assert_eq!(latest.batches_completed, 20);
        let eta = record.eta_data.unwrap();
        assert_eq!(eta.total_eta_seconds, 100.0);
        assert_eq!(eta.total_batches, 100);
    }

    #[test]
    fn remaining_is_extrapolated_from_rate() {
        let bar = parse_bar("30/40 [01:00<?, 2.00s/it]").unwrap();
        assert_eq!(bar.remaining(), Some(20.0));
    }

    #[test]
    fn empty_output_means_no_logs() {
        assert_eq!(parse_output("  \n"), ProgressRecord::no_logs());
        assert_eq!(parse_output("Loading dataset\n"), ProgressRecord::started());
    }
}
