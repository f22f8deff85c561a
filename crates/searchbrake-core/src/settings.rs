//! Backpressure configuration: serde snapshot plus a lock-free runtime handle.
//!
//! Two layers:
//!
//! 1. [`SearchBackpressureConfig`] is the serde-facing snapshot of every
//!    knob, with documented defaults, TOML loading, environment overrides,
//!    and range validation. Invalid values are rejected here; the controller
//!    never sees them.
//! 2. [`SearchBackpressureSettings`] is what the controller reads on the hot
//!    path. Static fields are frozen at construction; dynamic knobs live in
//!    atomic cells (floats as bit patterns) so reads are wait-free. Writers
//!    go through validated setters that fan out change notifications to
//!    subscribed listeners in subscription order.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackpressureError, BackpressureResult};

// ─── Defaults ───────────────────────────────────────────────────────────────

/// Documented defaults for every knob.
pub mod defaults {
    /// Control loop cadence in milliseconds.
    pub const INTERVAL_MS: u64 = 1_000;
    /// Whether the controller runs at all.
    pub const ENABLED: bool = true;
    /// Whether cancellations are fired (vs. observe-only).
    pub const ENFORCED: bool = true;
    /// Consecutive breaches before either dimension counts as duress.
    pub const NODE_DURESS_NUM_CONSECUTIVE_BREACHES: u32 = 3;
    /// Node CPU fraction at which an observation breaches.
    pub const NODE_DURESS_CPU_THRESHOLD: f64 = 0.9;
    /// Node heap fraction at which an observation breaches.
    pub const NODE_DURESS_HEAP_THRESHOLD: f64 = 0.7;
    /// Fraction of max heap that all live search tasks together must exceed
    /// before cancellation is considered.
    pub const SEARCH_HEAP_USAGE_THRESHOLD: f64 = 0.05;
    /// Fraction of max heap a single task must exceed before the heap
    /// tracker has an opinion.
    pub const SEARCH_TASK_HEAP_USAGE_THRESHOLD: f64 = 0.005;
    /// Multiplier over the rolling average heap usage a task must exceed.
    pub const SEARCH_TASK_HEAP_USAGE_VARIANCE: f64 = 2.0;
    /// Cumulative CPU time (ms) a task must exceed for a CPU verdict.
    pub const SEARCH_TASK_CPU_TIME_THRESHOLD_MS: u64 = 15;
    /// Wall time (ms) a task must exceed for an elapsed-time verdict.
    pub const SEARCH_TASK_ELAPSED_TIME_THRESHOLD_MS: u64 = 30_000;
    /// Cancellation tokens accrued per completed task.
    pub const CANCELLATION_RATIO: f64 = 0.1;
    /// Cancellation tokens accrued per nanosecond (3 per second).
    pub const CANCELLATION_RATE_NANOS: f64 = 3e-9;
    /// Burst capacity of both cancellation buckets.
    pub const CANCELLATION_BURST: f64 = 10.0;
}

// ─── Config Snapshot ────────────────────────────────────────────────────────

/// Serde snapshot of the full `search_backpressure.*` settings surface.
///
/// All fields have defaults; partial TOML files merge with them. Call
/// [`SearchBackpressureConfig::validate`] before handing the snapshot to the
/// controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchBackpressureConfig {
    /// Control loop cadence in milliseconds. Static; minimum 1.
    pub interval_ms: u64,

    /// Master switch. Dynamic.
    pub enabled: bool,

    /// When false, cancellation decisions are logged but not fired. Dynamic.
    pub enforced: bool,

    /// Consecutive breaches before duress. Dynamic; minimum 1.
    pub node_duress_num_consecutive_breaches: u32,

    /// Node CPU duress threshold, fraction in `0..=1`. Dynamic.
    pub node_duress_cpu_threshold: f64,

    /// Node heap duress threshold, fraction in `0..=1`. Dynamic.
    pub node_duress_heap_threshold: f64,

    /// Whole-search heap guard, fraction of max heap in `0..=1`. Dynamic.
    pub search_heap_usage_threshold: f64,

    /// Per-task heap floor, fraction of max heap in `0..=1`. Dynamic.
    pub search_task_heap_usage_threshold: f64,

    /// Per-task heap variance multiplier, `>= 0`. Dynamic.
    pub search_task_heap_usage_variance: f64,

    /// Per-task CPU time threshold in milliseconds. Dynamic.
    pub search_task_cpu_time_threshold_ms: u64,

    /// Per-task elapsed time threshold in milliseconds. Dynamic.
    pub search_task_elapsed_time_threshold_ms: u64,

    /// Cancellation tokens per completed task, `0..=1`. Static.
    pub cancellation_ratio: f64,

    /// Cancellation tokens per nanosecond, `> 0`. Static.
    pub cancellation_rate_nanos: f64,

    /// Burst capacity of both cancellation buckets, `> 0`. Static.
    pub cancellation_burst: f64,
}

impl Default for SearchBackpressureConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::INTERVAL_MS,
            enabled: defaults::ENABLED,
            enforced: defaults::ENFORCED,
            node_duress_num_consecutive_breaches: defaults::NODE_DURESS_NUM_CONSECUTIVE_BREACHES,
            node_duress_cpu_threshold: defaults::NODE_DURESS_CPU_THRESHOLD,
            node_duress_heap_threshold: defaults::NODE_DURESS_HEAP_THRESHOLD,
            search_heap_usage_threshold: defaults::SEARCH_HEAP_USAGE_THRESHOLD,
            search_task_heap_usage_threshold: defaults::SEARCH_TASK_HEAP_USAGE_THRESHOLD,
            search_task_heap_usage_variance: defaults::SEARCH_TASK_HEAP_USAGE_VARIANCE,
            search_task_cpu_time_threshold_ms: defaults::SEARCH_TASK_CPU_TIME_THRESHOLD_MS,
            search_task_elapsed_time_threshold_ms: defaults::SEARCH_TASK_ELAPSED_TIME_THRESHOLD_MS,
            cancellation_ratio: defaults::CANCELLATION_RATIO,
            cancellation_rate_nanos: defaults::CANCELLATION_RATE_NANOS,
            cancellation_burst: defaults::CANCELLATION_BURST,
        }
    }
}

impl SearchBackpressureConfig {
    /// Validate every field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(self) -> BackpressureResult<Self> {
        if self.interval_ms < 1 {
            return Err(invalid("interval", self.interval_ms, "must be at least 1 ms"));
        }
        if self.node_duress_num_consecutive_breaches < 1 {
            return Err(invalid(
                "node_duress.num_consecutive_breaches",
                self.node_duress_num_consecutive_breaches,
                "must be at least 1",
            ));
        }
        validate_fraction("node_duress.cpu_threshold", self.node_duress_cpu_threshold)?;
        validate_fraction("node_duress.heap_threshold", self.node_duress_heap_threshold)?;
        validate_fraction(
            "search_heap_usage_threshold",
            self.search_heap_usage_threshold,
        )?;
        validate_fraction(
            "search_task_heap_usage_threshold",
            self.search_task_heap_usage_threshold,
        )?;
        if !self.search_task_heap_usage_variance.is_finite()
            || self.search_task_heap_usage_variance < 0.0
        {
            return Err(invalid(
                "search_task_heap_usage_variance",
                self.search_task_heap_usage_variance,
                "must be a non-negative finite number",
            ));
        }
        validate_fraction("cancellation_ratio", self.cancellation_ratio)?;
        if !self.cancellation_rate_nanos.is_finite() || self.cancellation_rate_nanos <= 0.0 {
            return Err(invalid(
                "cancellation_rate",
                self.cancellation_rate_nanos,
                "must be a positive finite number",
            ));
        }
        if !self.cancellation_burst.is_finite() || self.cancellation_burst <= 0.0 {
            return Err(invalid(
                "cancellation_burst",
                self.cancellation_burst,
                "must be a positive finite number",
            ));
        }
        Ok(self)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] on parse failure or any
    /// out-of-range field.
    pub fn from_toml_str(contents: &str) -> BackpressureResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|error| BackpressureError::InvalidConfig {
                field: "search_backpressure",
                value: error.to_string(),
                reason: "TOML parse failure",
            })?;
        config.validate()
    }

    /// Load and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::Io`] when the file cannot be read, or
    /// the parse/validation errors of [`Self::from_toml_str`].
    pub fn from_toml_file(path: &Path) -> BackpressureResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Apply overrides from `SEARCHBRAKE_*` environment variables.
    ///
    /// Only overrides fields for which variables are set. Invalid values are
    /// silently ignored (the existing value is kept).
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SEARCHBRAKE_ENABLED") {
            self.enabled = val == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("SEARCHBRAKE_ENFORCED") {
            self.enforced = val == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("SEARCHBRAKE_INTERVAL_MS")
            && let Ok(ms) = val.parse::<u64>()
            && ms >= 1
        {
            self.interval_ms = ms;
        }
        if let Ok(val) = std::env::var("SEARCHBRAKE_CPU_THRESHOLD")
            && let Ok(threshold) = val.parse::<f64>()
            && (0.0..=1.0).contains(&threshold)
        {
            self.node_duress_cpu_threshold = threshold;
        }
        if let Ok(val) = std::env::var("SEARCHBRAKE_HEAP_THRESHOLD")
            && let Ok(threshold) = val.parse::<f64>()
            && (0.0..=1.0).contains(&threshold)
        {
            self.node_duress_heap_threshold = threshold;
        }
        self
    }
}

fn invalid(
    field: &'static str,
    value: impl fmt::Display,
    reason: &'static str,
) -> BackpressureError {
    BackpressureError::InvalidConfig {
        field,
        value: value.to_string(),
        reason,
    }
}

fn validate_fraction(field: &'static str, value: f64) -> BackpressureResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, value, "must be between 0.0 and 1.0"));
    }
    Ok(())
}

// ─── Setting Keys ───────────────────────────────────────────────────────────

/// Identity of one dynamic knob, used for change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Enabled,
    Enforced,
    NumConsecutiveBreaches,
    NodeDuressCpuThreshold,
    NodeDuressHeapThreshold,
    SearchHeapUsageThreshold,
    SearchTaskHeapUsageThreshold,
    SearchTaskHeapUsageVariance,
    SearchTaskCpuTimeThreshold,
    SearchTaskElapsedTimeThreshold,
}

impl SettingKey {
    /// Wire name under the `search_backpressure.` namespace.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Enforced => "enforced",
            Self::NumConsecutiveBreaches => "node_duress.num_consecutive_breaches",
            Self::NodeDuressCpuThreshold => "node_duress.cpu_threshold",
            Self::NodeDuressHeapThreshold => "node_duress.heap_threshold",
            Self::SearchHeapUsageThreshold => "search_heap_usage_threshold",
            Self::SearchTaskHeapUsageThreshold => "search_task_heap_usage_threshold",
            Self::SearchTaskHeapUsageVariance => "search_task_heap_usage_variance",
            Self::SearchTaskCpuTimeThreshold => "search_task_cpu_time_threshold",
            Self::SearchTaskElapsedTimeThreshold => "search_task_elapsed_time_threshold",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change-notification callback registered via
/// [`SearchBackpressureSettings::on_change`].
pub type SettingListener = Box<dyn Fn(SettingKey) + Send + Sync>;

// ─── Runtime Settings ───────────────────────────────────────────────────────

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Runtime settings handle read by the controller on the hot path.
///
/// Static fields are immutable after construction. Dynamic fields are atomic
/// cells: reads are wait-free, writers apply a validated single atomic store
/// and then notify listeners subscribed to that key, in subscription order,
/// on the writer's thread.
pub struct SearchBackpressureSettings {
    interval: Duration,
    cancellation_ratio: f64,
    cancellation_rate_nanos: f64,
    cancellation_burst: f64,

    enabled: AtomicBool,
    enforced: AtomicBool,
    num_consecutive_breaches: AtomicU32,
    node_duress_cpu_threshold: AtomicU64,
    node_duress_heap_threshold: AtomicU64,
    search_heap_usage_threshold: AtomicU64,
    search_task_heap_usage_threshold: AtomicU64,
    search_task_heap_usage_variance: AtomicU64,
    search_task_cpu_time_threshold_nanos: AtomicU64,
    search_task_elapsed_time_threshold_nanos: AtomicU64,

    listeners: Mutex<Vec<(SettingKey, SettingListener)>>,
}

impl SearchBackpressureSettings {
    /// Freeze a validated config into a runtime handle.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] when the config fails
    /// validation.
    pub fn new(config: SearchBackpressureConfig) -> BackpressureResult<Self> {
        let config = config.validate()?;
        Ok(Self {
            interval: Duration::from_millis(config.interval_ms),
            cancellation_ratio: config.cancellation_ratio,
            cancellation_rate_nanos: config.cancellation_rate_nanos,
            cancellation_burst: config.cancellation_burst,
            enabled: AtomicBool::new(config.enabled),
            enforced: AtomicBool::new(config.enforced),
            num_consecutive_breaches: AtomicU32::new(config.node_duress_num_consecutive_breaches),
            node_duress_cpu_threshold: AtomicU64::new(config.node_duress_cpu_threshold.to_bits()),
            node_duress_heap_threshold: AtomicU64::new(config.node_duress_heap_threshold.to_bits()),
            search_heap_usage_threshold: AtomicU64::new(
                config.search_heap_usage_threshold.to_bits(),
            ),
            search_task_heap_usage_threshold: AtomicU64::new(
                config.search_task_heap_usage_threshold.to_bits(),
            ),
            search_task_heap_usage_variance: AtomicU64::new(
                config.search_task_heap_usage_variance.to_bits(),
            ),
            search_task_cpu_time_threshold_nanos: AtomicU64::new(
                config
                    .search_task_cpu_time_threshold_ms
                    .saturating_mul(NANOS_PER_MILLI),
            ),
            search_task_elapsed_time_threshold_nanos: AtomicU64::new(
                config
                    .search_task_elapsed_time_threshold_ms
                    .saturating_mul(NANOS_PER_MILLI),
            ),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Runtime handle with all defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        // Defaults always satisfy validation.
        Self::new(SearchBackpressureConfig::default()).expect("default config is valid")
    }

    // ── Static accessors ────────────────────────────────────────────

    /// Control loop cadence.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancellation tokens per completed task.
    #[must_use]
    pub const fn cancellation_ratio(&self) -> f64 {
        self.cancellation_ratio
    }

    /// Cancellation tokens per nanosecond.
    #[must_use]
    pub const fn cancellation_rate_nanos(&self) -> f64 {
        self.cancellation_rate_nanos
    }

    /// Burst capacity of both cancellation buckets.
    #[must_use]
    pub const fn cancellation_burst(&self) -> f64 {
        self.cancellation_burst
    }

    // ── Dynamic accessors ───────────────────────────────────────────

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn enforced(&self) -> bool {
        self.enforced.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn num_consecutive_breaches(&self) -> u32 {
        self.num_consecutive_breaches.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn node_duress_cpu_threshold(&self) -> f64 {
        f64::from_bits(self.node_duress_cpu_threshold.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn node_duress_heap_threshold(&self) -> f64 {
        f64::from_bits(self.node_duress_heap_threshold.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn search_heap_usage_threshold(&self) -> f64 {
        f64::from_bits(self.search_heap_usage_threshold.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn search_task_heap_usage_threshold(&self) -> f64 {
        f64::from_bits(self.search_task_heap_usage_threshold.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn search_task_heap_usage_variance(&self) -> f64 {
        f64::from_bits(self.search_task_heap_usage_variance.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn search_task_cpu_time_threshold_nanos(&self) -> u64 {
        self.search_task_cpu_time_threshold_nanos
            .load(Ordering::Acquire)
    }

    #[must_use]
    pub fn search_task_elapsed_time_threshold_nanos(&self) -> u64 {
        self.search_task_elapsed_time_threshold_nanos
            .load(Ordering::Acquire)
    }

    // ── Dynamic setters ─────────────────────────────────────────────

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        self.notify(SettingKey::Enabled);
    }

    pub fn set_enforced(&self, enforced: bool) {
        self.enforced.store(enforced, Ordering::Release);
        self.notify(SettingKey::Enforced);
    }

    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] when `breaches` is zero.
    pub fn set_num_consecutive_breaches(&self, breaches: u32) -> BackpressureResult<()> {
        if breaches < 1 {
            return Err(invalid(
                "node_duress.num_consecutive_breaches",
                breaches,
                "must be at least 1",
            ));
        }
        self.num_consecutive_breaches
            .store(breaches, Ordering::Release);
        self.notify(SettingKey::NumConsecutiveBreaches);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] for values outside `0..=1`.
    pub fn set_node_duress_cpu_threshold(&self, threshold: f64) -> BackpressureResult<()> {
        validate_fraction("node_duress.cpu_threshold", threshold)?;
        self.node_duress_cpu_threshold
            .store(threshold.to_bits(), Ordering::Release);
        self.notify(SettingKey::NodeDuressCpuThreshold);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] for values outside `0..=1`.
    pub fn set_node_duress_heap_threshold(&self, threshold: f64) -> BackpressureResult<()> {
        validate_fraction("node_duress.heap_threshold", threshold)?;
        self.node_duress_heap_threshold
            .store(threshold.to_bits(), Ordering::Release);
        self.notify(SettingKey::NodeDuressHeapThreshold);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] for values outside `0..=1`.
    pub fn set_search_heap_usage_threshold(&self, threshold: f64) -> BackpressureResult<()> {
        validate_fraction("search_heap_usage_threshold", threshold)?;
        self.search_heap_usage_threshold
            .store(threshold.to_bits(), Ordering::Release);
        self.notify(SettingKey::SearchHeapUsageThreshold);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] for values outside `0..=1`.
    pub fn set_search_task_heap_usage_threshold(&self, threshold: f64) -> BackpressureResult<()> {
        validate_fraction("search_task_heap_usage_threshold", threshold)?;
        self.search_task_heap_usage_threshold
            .store(threshold.to_bits(), Ordering::Release);
        self.notify(SettingKey::SearchTaskHeapUsageThreshold);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`BackpressureError::InvalidConfig`] for negative or
    /// non-finite values.
    pub fn set_search_task_heap_usage_variance(&self, variance: f64) -> BackpressureResult<()> {
        if !variance.is_finite() || variance < 0.0 {
            return Err(invalid(
                "search_task_heap_usage_variance",
                variance,
                "must be a non-negative finite number",
            ));
        }
        self.search_task_heap_usage_variance
            .store(variance.to_bits(), Ordering::Release);
        self.notify(SettingKey::SearchTaskHeapUsageVariance);
        Ok(())
    }

    pub fn set_search_task_cpu_time_threshold_ms(&self, millis: u64) {
        self.search_task_cpu_time_threshold_nanos
            .store(millis.saturating_mul(NANOS_PER_MILLI), Ordering::Release);
        self.notify(SettingKey::SearchTaskCpuTimeThreshold);
    }

    pub fn set_search_task_elapsed_time_threshold_ms(&self, millis: u64) {
        self.search_task_elapsed_time_threshold_nanos
            .store(millis.saturating_mul(NANOS_PER_MILLI), Ordering::Release);
        self.notify(SettingKey::SearchTaskElapsedTimeThreshold);
    }

    // ── Change notification ─────────────────────────────────────────

    /// Subscribe to updates of one dynamic knob.
    ///
    /// The callback runs on the writer's thread, after the new value is
    /// visible, in subscription order.
    pub fn on_change(&self, key: SettingKey, listener: SettingListener) {
        let mut listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push((key, listener));
    }

    fn notify(&self, key: SettingKey) {
        let listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (registered, listener) in listeners.iter() {
            if *registered == key {
                listener(key);
            }
        }
    }
}

impl fmt::Debug for SearchBackpressureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchBackpressureSettings")
            .field("interval", &self.interval)
            .field("enabled", &self.enabled())
            .field("enforced", &self.enforced())
            .field("num_consecutive_breaches", &self.num_consecutive_breaches())
            .field("cpu_threshold", &self.node_duress_cpu_threshold())
            .field("heap_threshold", &self.node_duress_heap_threshold())
            .field("cancellation_ratio", &self.cancellation_ratio)
            .field("cancellation_rate_nanos", &self.cancellation_rate_nanos)
            .field("cancellation_burst", &self.cancellation_burst)
            .finish_non_exhaustive()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
