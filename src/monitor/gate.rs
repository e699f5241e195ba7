//! Notification deduplication.
//!
//! Bounds outbound progress messages to roughly one per 5 points of
//! progress or one per 10 ticks, whichever comes first, while never
//! swallowing a completion.

use std::fmt;

use crate::state::LastNotification;

/// Progress gain, in percentage points, that warrants a new message.
pub const PROGRESS_DELTA_THRESHOLD: f64 = 5.0;

/// Ticks of silence after which a keepalive goes out.
pub const KEEPALIVE_TICKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationReason {
    JobCompleted,
    FirstMeaningful,
    JobStarted,
    ProgressDelta,
    Keepalive,
    NoChange,
    SkipZeros,
}

impl NotificationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationReason::JobCompleted => "job_completed",
            NotificationReason::FirstMeaningful => "first_meaningful",
            NotificationReason::JobStarted => "job_started",
            NotificationReason::ProgressDelta => "progress_delta",
            NotificationReason::Keepalive => "keepalive",
            NotificationReason::NoChange => "no_change",
            NotificationReason::SkipZeros => "skip_zeros",
        }
    }
}

impl fmt::Display for NotificationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationDecision {
    pub should_send: bool,
    pub reason: NotificationReason,
}

impl NotificationDecision {
    fn send(reason: NotificationReason) -> Self {
        Self {
            should_send: true,
            reason,
        }
    }

    fn suppress(reason: NotificationReason) -> Self {
        Self {
            should_send: false,
            reason,
        }
    }
}

/// Decides whether the current fleet progress deserves a notification.
/// Rules are evaluated in order and the first match wins.
pub fn decide(
    current_progress: f64,
    current_remaining_minutes: u64,
    current_completed_count: usize,
    last: Option<&LastNotification>,
    attempt: u32,
) -> NotificationDecision {
    if current_progress == 0.0 && current_remaining_minutes == 0 {
        return NotificationDecision::suppress(NotificationReason::SkipZeros);
    }

    let last_completed = last.map(|l| l.completed_count).unwrap_or(0);
    if current_completed_count > last_completed {
        return NotificationDecision::send(NotificationReason::JobCompleted);
    }

    let last = match last {
        Some(last) => last,
        None => return NotificationDecision::send(NotificationReason::FirstMeaningful),
    };

    if last.progress_percentage == 0.0 && current_progress > 0.0 {
        return NotificationDecision::send(NotificationReason::JobStarted);
    }

    if current_progress - last.progress_percentage >= PROGRESS_DELTA_THRESHOLD {
        return NotificationDecision::send(NotificationReason::ProgressDelta);
    }

    if attempt.saturating_sub(last.attempt_sent) >= KEEPALIVE_TICKS {
        return NotificationDecision::send(NotificationReason::Keepalive);
    }

    NotificationDecision::suppress(NotificationReason::NoChange)
}

/// Completions are surfaced on their own path, ahead of the gate, so a
/// completion that coincides with an all-zero aggregate is never lost.
pub fn decide_with_completions(
    current_progress: f64,
    current_remaining_minutes: u64,
    current_completed_count: usize,
    last: Option<&LastNotification>,
    attempt: u32,
) -> NotificationDecision {
    let last_completed = last.map(|l| l.completed_count).unwrap_or(0);
    if current_completed_count > last_completed {
        return NotificationDecision::send(NotificationReason::JobCompleted);
    }
    decide(
        current_progress,
        current_remaining_minutes,
        current_completed_count,
        last,
        attempt,
    )
}
