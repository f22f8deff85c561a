//! Fixed-window rolling average of `i64` observations.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BackpressureError, BackpressureResult};

/// Rolling average over the last `window` observations.
///
/// Backed by a ring buffer of exactly `window` slots; the `count % window`-th
/// slot is overwritten on each record and the running sum is adjusted by the
/// displaced value. `record` is serialized under a single mutex; `average`,
/// `ready`, and `count` read a published snapshot and may lag a concurrent
/// `record` by one observation.
#[derive(Debug)]
pub struct MovingAverage {
    window: usize,
    inner: Mutex<Ring>,
    published_average: AtomicU64,
    published_count: AtomicU64,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<i64>,
    count: u64,
    sum: i64,
}

impl MovingAverage {
    /// Creates a moving average over `window` observations.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] when `window` is zero.
    pub fn new(window: usize) -> BackpressureResult<Self> {
        if window == 0 {
            return Err(BackpressureError::InvalidConfig {
                field: "moving_average.window",
                value: "0".to_owned(),
                reason: "window size must be greater than zero",
            });
        }
        Ok(Self {
            window,
            inner: Mutex::new(Ring {
                slots: vec![0; window],
                count: 0,
                sum: 0,
            }),
            published_average: AtomicU64::new(0.0_f64.to_bits()),
            published_count: AtomicU64::new(0),
        })
    }

    /// Record one observation and return the updated average.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&self, value: i64) -> f64 {
        let mut ring = lock_or_recover(&self.inner);
        let index = usize::try_from(ring.count % self.window as u64).unwrap_or(0);
        let displaced = ring.slots[index];
        ring.slots[index] = value;
        ring.sum += value - displaced;
        ring.count += 1;

        let denominator = ring.count.min(self.window as u64);
        let average = ring.sum as f64 / denominator as f64;
        self.published_average
            .store(average.to_bits(), Ordering::Release);
        self.published_count.store(ring.count, Ordering::Release);
        average
    }

    /// Last published average. Zero until the first observation.
    #[must_use]
    pub fn average(&self) -> f64 {
        f64::from_bits(self.published_average.load(Ordering::Acquire))
    }

    /// Whether a full window of observations has been recorded.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.count() >= self.window as u64
    }

    /// Total observations ever recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.published_count.load(Ordering::Acquire)
    }

    /// Configured window size.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
