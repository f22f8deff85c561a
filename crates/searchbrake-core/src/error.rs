/// Unified error type for the searchbrake controller and its collaborators.
///
/// Most failures inside the control loop are contained within a single tick
/// and logged rather than propagated; the variants here surface at
/// construction and configuration time, or cross the collaborator seams
/// (sensors, task registry, scheduler).
#[derive(Debug, thiserror::Error)]
pub enum BackpressureError {
    /// A configuration value is outside its documented range.
    #[error("invalid config: {field} = \"{value}\" ({reason})")]
    InvalidConfig {
        /// Which config field.
        field: &'static str,
        /// The rejected value, rendered for the operator.
        value: String,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// A CPU or heap sensor could not produce a reading.
    ///
    /// The duress detector treats the affected dimension as "not breached"
    /// for that observation; the controller never cancels on partial signal.
    #[error("{sensor} sensor unavailable: {source}")]
    SensorUnavailable {
        /// Which sensor failed ("cpu" or "heap").
        sensor: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The task registry failed to refresh resource stats.
    ///
    /// Non-fatal: the tick proceeds with stale stats.
    #[error("task stats refresh failed: {source}")]
    StatsRefreshFailed {
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Signalling cancellation to a task failed.
    ///
    /// The tick logs this and proceeds with the remaining candidates.
    #[error("failed to cancel task {task_id}: {source}")]
    CancelFailed {
        /// Id of the task that could not be cancelled.
        task_id: u64,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The scheduler could not start or host the periodic tick.
    #[error("scheduler unavailable: {reason}")]
    SchedulerUnavailable {
        /// What went wrong while scheduling.
        reason: String,
    },

    /// Wraps `std::io::Error` for config file loading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the searchbrake crates.
pub type BackpressureResult<T> = Result<T, BackpressureError>;
