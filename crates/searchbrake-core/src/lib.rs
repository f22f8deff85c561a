//! Shared primitives and collaborator seams for the searchbrake node-local
//! search backpressure controller.
//!
//! This crate defines the leaf mechanisms the controller is built from
//! ([`Streak`], [`MovingAverage`], [`TokenBucket`]), the error type
//! ([`BackpressureError`]), the settings surface
//! ([`SearchBackpressureConfig`] / [`SearchBackpressureSettings`]), and the
//! seams to external collaborators ([`TaskRegistry`], [`ResourceSensors`],
//! [`Scheduler`], [`Clock`]).
//!
//! It has minimal external dependencies and is depended on by the
//! `searchbrake` controller crate.

pub mod clock;
pub mod error;
pub mod moving_average;
pub mod scheduler;
pub mod sensors;
pub mod settings;
pub mod streak;
pub mod task;
pub mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackpressureError, BackpressureResult};
pub use moving_average::MovingAverage;
pub use scheduler::{ScheduleHandle, Scheduler};
pub use sensors::ResourceSensors;
pub use settings::{
    SearchBackpressureConfig, SearchBackpressureSettings, SettingKey, SettingListener, defaults,
};
pub use streak::Streak;
pub use task::{TaskCompletionListener, TaskHandle, TaskKind, TaskRegistry};
pub use token_bucket::{BucketClock, TokenBucket};
