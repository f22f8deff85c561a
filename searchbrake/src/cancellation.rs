//! Per-task cancellation bundles.
//!
//! A [`TaskCancellation`] pairs one live task with the verdicts trackers
//! produced against it. Bundles order by total score so the control loop
//! cancels the most relieving tasks first, and know how to fire the actual
//! cancellation: signal the task, credit each contributing tracker, and
//! snapshot the task's final resource usage.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use searchbrake_core::clock::Clock;
use searchbrake_core::error::BackpressureResult;
use searchbrake_core::task::TaskHandle;

use crate::stats::CancelledTaskStats;
use crate::trackers::{ResourceUsageTracker, Verdict};

/// One tracker's verdict against a task, with the tracker kept alongside so
/// a fired cancellation can credit it.
pub struct CancellationReason {
    tracker: Arc<dyn ResourceUsageTracker>,
    verdict: Verdict,
}

impl CancellationReason {
    #[must_use]
    pub fn new(tracker: Arc<dyn ResourceUsageTracker>, verdict: Verdict) -> Self {
        Self { tracker, verdict }
    }

    /// The tracker that produced this verdict.
    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn ResourceUsageTracker> {
        &self.tracker
    }

    /// Reason fragment joined into the task's cancellation message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        self.verdict.message
    }

    /// Relief estimate, at least 1.
    #[must_use]
    pub const fn score(&self) -> u32 {
        self.verdict.score
    }
}

impl fmt::Debug for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationReason")
            .field("tracker", &self.tracker.name())
            .field("message", &self.verdict.message)
            .field("score", &self.verdict.score)
            .finish()
    }
}

/// A task plus every verdict produced against it in one tick.
pub struct TaskCancellation {
    task: Arc<dyn TaskHandle>,
    reasons: Vec<CancellationReason>,
}

impl TaskCancellation {
    #[must_use]
    pub fn new(task: Arc<dyn TaskHandle>, reasons: Vec<CancellationReason>) -> Self {
        Self { task, reasons }
    }

    #[must_use]
    pub fn task(&self) -> &Arc<dyn TaskHandle> {
        &self.task
    }

    #[must_use]
    pub fn reasons(&self) -> &[CancellationReason] {
        &self.reasons
    }

    /// Sum of all verdict scores. Higher totals mean cancelling this task is
    /// expected to relieve more pressure.
    #[must_use]
    pub fn total_score(&self) -> u32 {
        self.reasons.iter().map(CancellationReason::score).sum()
    }

    /// Eligible iff the task is not already cancelled and at least one
    /// tracker produced a verdict.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        !self.task.is_cancelled() && !self.reasons.is_empty()
    }

    /// Comma-joined verdict messages, e.g.
    /// `cpu usage exceeded, elapsed time exceeded`.
    #[must_use]
    pub fn reason_string(&self) -> String {
        self.reasons
            .iter()
            .map(CancellationReason::message)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Fire the cancellation.
    ///
    /// Signals the task with the joined reason string, then credits every
    /// contributing tracker and snapshots the task's final usage. On signal
    /// failure nothing is credited or snapshotted.
    ///
    /// # Errors
    ///
    /// Propagates the task handle's cancellation error.
    pub fn cancel(&self, clock: &dyn Clock) -> BackpressureResult<CancelledTaskStats> {
        let message = format!("resource consumption exceeded [{}]", self.reason_string());
        self.task.cancel(&message)?;

        for reason in &self.reasons {
            reason.tracker().increment_cancellations();
        }

        let elapsed = clock.now_nanos() - self.task.start_time_nanos();
        Ok(CancelledTaskStats {
            heap_usage_bytes: self.task.heap_bytes(),
            cpu_usage_nanos: self.task.cpu_time_nanos(),
            elapsed_time_nanos: u64::try_from(elapsed).unwrap_or(0),
        })
    }
}

impl fmt::Debug for TaskCancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCancellation")
            .field("task_id", &self.task.id())
            .field("total_score", &self.total_score())
            .field("reasons", &self.reasons)
            .finish()
    }
}

impl PartialEq for TaskCancellation {
    fn eq(&self, other: &Self) -> bool {
        self.total_score() == other.total_score() && self.task.id() == other.task.id()
    }
}

impl Eq for TaskCancellation {}

impl PartialOrd for TaskCancellation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Plan order: descending total score, ties broken on ascending task id so
/// sort output is deterministic.
impl Ord for TaskCancellation {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .total_score()
            .cmp(&self.total_score())
            .then_with(|| self.task.id().cmp(&other.task.id()))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
