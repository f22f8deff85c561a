//! Node-local search backpressure controller.
//!
//! searchbrake watches CPU and heap pressure on a single server and, when
//! the node is under sustained duress, cancels the in-flight search shard
//! tasks that are disproportionately responsible for that pressure. The
//! periodic control loop decides *whether* to act (a hysteretic duress
//! detector driven by consecutive-breach streaks), *which* tasks to stop
//! (per-task resource trackers scored and ranked into a cancellation plan),
//! and *how many* to stop per unit of time (a dual token-bucket budget over
//! wall time and task completions).
//!
//! # Wiring
//!
//! The controller consumes its environment through seams defined in
//! [`searchbrake_core`]: a [`TaskRegistry`] for live tasks and completion
//! callbacks, [`ResourceSensors`] for node pressure, a [`Clock`], and a
//! [`Scheduler`] for the periodic tick. This crate ships production
//! implementations of the latter three ([`HostSensors`],
//! [`FixedDelayScheduler`], and `SystemClock` re-exported from core);
//! deterministic substitutes drive the tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use searchbrake::{
//!     FixedDelayScheduler, HostSensors, SearchBackpressureConfig,
//!     SearchBackpressureController, SearchBackpressureSettings, SystemClock,
//! };
//! # fn engine_registry() -> Arc<dyn searchbrake::TaskRegistry> { unimplemented!() }
//!
//! # fn main() -> searchbrake::BackpressureResult<()> {
//! let settings = Arc::new(SearchBackpressureSettings::new(
//!     SearchBackpressureConfig::default().with_env_overrides(),
//! )?);
//! let controller = SearchBackpressureController::new(
//!     settings,
//!     engine_registry(),
//!     Arc::new(HostSensors::new()?),
//!     Arc::new(SystemClock::new()),
//! )?;
//! controller.start(&FixedDelayScheduler::new())?;
//! # Ok(())
//! # }
//! ```

pub mod cancellation;
pub mod controller;
pub mod scheduler;
pub mod sensors;
pub mod stats;
pub mod trackers;

pub use cancellation::{CancellationReason, TaskCancellation};
pub use controller::SearchBackpressureController;
pub use scheduler::FixedDelayScheduler;
pub use sensors::HostSensors;
pub use stats::{
    CancellationSection, CancellationStats, CancelledTaskStats, CurrentStats,
    SearchBackpressureStats, ShardTaskCurrentStats,
};
pub use trackers::{
    CpuUsageTracker, ElapsedTimeTracker, HEAP_MOVING_AVERAGE_WINDOW, HeapResourceStats,
    HeapUsageTracker, ResourceStats, ResourceUsageTracker, TrackerName, TrackerStats, Verdict,
};

pub use searchbrake_core::{
    BackpressureError, BackpressureResult, Clock, ManualClock, MovingAverage, ResourceSensors,
    ScheduleHandle, Scheduler, SearchBackpressureConfig, SearchBackpressureSettings, SettingKey,
    Streak, SystemClock, TaskCompletionListener, TaskHandle, TaskKind, TaskRegistry, TokenBucket,
};
