//! Collaborator seams for the task execution engine.
//!
//! The controller does not own tasks: it observes their cumulative resource
//! usage through [`TaskHandle`] and signals cancellation through the same
//! handle. The execution engine exposes its live task set and completion
//! callbacks through [`TaskRegistry`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::BackpressureResult;

/// Classification of a task as seen by the backpressure controller.
///
/// Only search shard tasks are eligible for backpressure cancellation; every
/// other kind is ignored by the completion listener and the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A cancellable shard-level search task.
    SearchShard,
    /// Any other task kind.
    Other,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SearchShard => f.write_str("search_shard"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Handle to one live task owned by the execution engine.
///
/// Resource accessors are cumulative monotonic estimates maintained by the
/// engine; `heap_bytes` in particular is an allocation estimate, not a live
/// RSS measurement. The handle outlives neither the engine nor the task.
pub trait TaskHandle: Send + Sync {
    /// Engine-assigned task id, unique among live tasks.
    fn id(&self) -> u64;

    /// Action name, e.g. `indices:data/read/search[phase/query]`.
    fn action(&self) -> &str;

    /// Task classification.
    fn kind(&self) -> TaskKind;

    /// Cumulative CPU time consumed, in nanoseconds.
    fn cpu_time_nanos(&self) -> u64;

    /// Cumulative heap bytes allocated (monotonic estimate).
    fn heap_bytes(&self) -> u64;

    /// Start time on the controller's clock, in nanoseconds.
    fn start_time_nanos(&self) -> i64;

    /// Whether the task has already been cancelled.
    fn is_cancelled(&self) -> bool;

    /// Signal cancellation with a human-readable reason.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackpressureError::CancelFailed`] (or an
    /// engine-specific error) when the signal cannot be delivered.
    fn cancel(&self, reason: &str) -> BackpressureResult<()>;
}

/// Callback invoked by the execution engine for every completed task.
///
/// Fan-out is in-thread: the engine calls listeners synchronously, in
/// registration order, from whichever worker thread completed the task.
pub trait TaskCompletionListener: Send + Sync {
    /// Called once per completed task, after its resource stats settle.
    fn on_task_completed(&self, task: &Arc<dyn TaskHandle>);
}

/// The execution engine's view of live, resource-tracked tasks.
pub trait TaskRegistry: Send + Sync {
    /// All live search shard tasks, in no particular order.
    fn live_search_shard_tasks(&self) -> Vec<Arc<dyn TaskHandle>>;

    /// Force-refresh the resource stats of the given tasks.
    ///
    /// Best-effort: callers treat failure as non-fatal and proceed with
    /// stale stats.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackpressureError::StatsRefreshFailed`] when the
    /// engine cannot refresh.
    fn refresh_stats(&self, tasks: &[Arc<dyn TaskHandle>]) -> BackpressureResult<()>;

    /// Register a completion listener. Listeners are never deregistered.
    fn add_completion_listener(&self, listener: Arc<dyn TaskCompletionListener>);
}
