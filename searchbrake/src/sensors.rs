//! `sysinfo`-backed implementation of the node resource sensors.

use std::fmt;
use std::sync::Mutex;

use sysinfo::System;

use searchbrake_core::error::{BackpressureError, BackpressureResult};
use searchbrake_core::sensors::ResourceSensors;

/// OS-signal sensors for the duress detector.
///
/// CPU utilization is the system-wide usage reported by `sysinfo`, scaled to
/// a `0..=1` fraction. Heap is approximated by system memory: used over
/// total, with total memory doubling as the process max-heap constant the
/// per-task thresholds are fractions of.
pub struct HostSensors {
    system: Mutex<System>,
    max_heap_bytes: u64,
}

impl HostSensors {
    /// Create the sensors and take an initial reading.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::SensorUnavailable`] when the host
    /// reports zero total memory (no meaningful heap fractions exist).
    pub fn new() -> BackpressureResult<Self> {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();

        let max_heap_bytes = system.total_memory();
        if max_heap_bytes == 0 {
            return Err(BackpressureError::SensorUnavailable {
                sensor: "heap",
                source: Box::new(std::io::Error::other("total memory reported as zero")),
            });
        }

        Ok(Self {
            system: Mutex::new(system),
            max_heap_bytes,
        })
    }
}

impl ResourceSensors for HostSensors {
    fn cpu_utilization(&self) -> BackpressureResult<f64> {
        let mut system = lock_or_recover(&self.system);
        system.refresh_cpu_all();
        let pct = f64::from(system.global_cpu_usage());
        Ok(clamp_fraction(pct / 100.0))
    }

    #[allow(clippy::cast_precision_loss)]
    fn heap_used_fraction(&self) -> BackpressureResult<f64> {
        let mut system = lock_or_recover(&self.system);
        system.refresh_memory();
        let used = system.used_memory() as f64;
        let total = self.max_heap_bytes as f64;
        Ok(clamp_fraction(used / total))
    }

    fn max_heap_bytes(&self) -> u64 {
        self.max_heap_bytes
    }
}

impl fmt::Debug for HostSensors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSensors")
            .field("max_heap_bytes", &self.max_heap_bytes)
            .finish_non_exhaustive()
    }
}

/// Clamp a raw sensor fraction: NaN and negatives become 0, values above 1
/// (hyperthreading artifacts, races during refresh) become 1.
fn clamp_fraction(value: f64) -> f64 {
    if !value.is_finite() || value < 0.0 {
        0.0
    } else {
        value.min(1.0)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
