//! Node resource sensor seam.

use crate::error::BackpressureResult;

/// Whole-node resource sensors consumed by the duress detector.
///
/// Implementations wrap whatever the host exposes (OS counters, runtime
/// statistics); tests supply deterministic stubs. Fractions are in `0..=1`.
pub trait ResourceSensors: Send + Sync {
    /// Node CPU utilization as a fraction of total capacity.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackpressureError::SensorUnavailable`] when no
    /// reading can be produced. The caller treats the observation as "not
    /// breached" and never cancels on partial signal.
    fn cpu_utilization(&self) -> BackpressureResult<f64>;

    /// Fraction of the maximum heap currently in use.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackpressureError::SensorUnavailable`] when no
    /// reading can be produced.
    fn heap_used_fraction(&self) -> BackpressureResult<f64>;

    /// Maximum heap size in bytes. Constant after startup; per-task and
    /// whole-search heap thresholds are fractions of this value.
    fn max_heap_bytes(&self) -> u64;
}
