//! Fixed-delay scheduling seam for the periodic control loop.

use std::time::Duration;

use crate::error::BackpressureResult;

/// Cancellation handle for a scheduled periodic task.
pub trait ScheduleHandle: Send {
    /// Stop future executions. Idempotent; an in-flight execution completes
    /// before the schedule is considered stopped.
    fn cancel(&self);
}

/// Capability to run a callback repeatedly with a fixed delay between the
/// end of one execution and the start of the next.
pub trait Scheduler: Send + Sync {
    /// Schedule `tick` every `interval`, returning a cancel handle.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackpressureError::SchedulerUnavailable`] when the
    /// schedule cannot be established (e.g. worker spawn failure).
    fn schedule_fixed_delay(
        &self,
        interval: Duration,
        tick: Box<dyn Fn() + Send>,
    ) -> BackpressureResult<Box<dyn ScheduleHandle>>;
}
