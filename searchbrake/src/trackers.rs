//! Per-task resource usage trackers.
//!
//! Each tracker watches one resource dimension across the live search shard
//! task set, produces per-task cancellation verdicts, and reports stats for
//! the observability snapshot. Verdicts are explicit [`Option`]s; a tracker
//! with no opinion simply contributes nothing to a task's cancellation
//! bundle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use searchbrake_core::clock::Clock;
use searchbrake_core::error::BackpressureResult;
use searchbrake_core::moving_average::MovingAverage;
use searchbrake_core::settings::SearchBackpressureSettings;
use searchbrake_core::task::TaskHandle;

/// Observations the heap tracker needs before it will produce verdicts.
pub const HEAP_MOVING_AVERAGE_WINDOW: usize = 100;

// ─── Names & Verdicts ───────────────────────────────────────────────────────

/// Stable identity of a tracker, used in stats breakups and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrackerName {
    #[serde(rename = "cpu_usage_tracker")]
    CpuUsage,
    #[serde(rename = "heap_usage_tracker")]
    HeapUsage,
    #[serde(rename = "elapsed_time_tracker")]
    ElapsedTime,
}

impl TrackerName {
    /// Wire name used in the stats snapshot.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CpuUsage => "cpu_usage_tracker",
            Self::HeapUsage => "heap_usage_tracker",
            Self::ElapsedTime => "elapsed_time_tracker",
        }
    }
}

impl fmt::Display for TrackerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracker's opinion that a task should be cancelled.
///
/// The score estimates the relief from cancelling the task: binary
/// thresholds score 1; the heap tracker scores how many typical tasks'
/// worth of heap the cancellation would reclaim. Scores are additive across
/// trackers on the same task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Human-readable fragment joined into the cancellation reason string.
    pub message: &'static str,
    /// Relief estimate, at least 1.
    pub score: u32,
}

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Max and average of one resource dimension over the live task set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub current_max: f64,
    pub current_avg: f64,
}

/// Heap dimension stats, including the completion-fed rolling average.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeapResourceStats {
    pub current_max: f64,
    pub current_avg: f64,
    pub rolling_avg: f64,
}

/// Point-in-time stats of one tracker, as a sum over the concrete kinds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStats {
    Cpu(ResourceStats),
    Heap(HeapResourceStats),
    ElapsedTime(ResourceStats),
}

fn max_and_avg(values: impl Iterator<Item = f64>) -> ResourceStats {
    let mut max = 0.0_f64;
    let mut sum = 0.0_f64;
    let mut count = 0_u32;
    for value in values {
        max = max.max(value);
        sum += value;
        count += 1;
    }
    let current_avg = if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    };
    ResourceStats {
        current_max: max,
        current_avg,
    }
}

// ─── Tracker Contract ───────────────────────────────────────────────────────

/// Contract shared by all resource usage trackers.
///
/// `update` is invoked for every completed search shard task;
/// `cancellation_reason` is consulted per live task during a duress tick.
/// Each tracker owns its cancellation counter, bumped by the cancellation
/// bundle when a verdict it contributed leads to an actual cancellation.
pub trait ResourceUsageTracker: Send + Sync {
    /// Stable tracker identity.
    fn name(&self) -> TrackerName;

    /// Observe one completed task. May be a no-op for stateless trackers.
    fn update(&self, task: &dyn TaskHandle);

    /// This tracker's verdict for the given live task, if any.
    fn cancellation_reason(&self, task: &dyn TaskHandle) -> Option<Verdict>;

    /// Stats over the currently live task set.
    fn current_stats(&self, active_tasks: &[Arc<dyn TaskHandle>]) -> TrackerStats;

    /// Total cancellations this tracker has contributed to. Monotonic.
    fn cancellations_count(&self) -> u64;

    /// Record that a cancellation this tracker voted for was fired.
    fn increment_cancellations(&self);
}

// ─── CPU ────────────────────────────────────────────────────────────────────

/// Flags tasks whose cumulative CPU time exceeds the configured threshold.
pub struct CpuUsageTracker {
    settings: Arc<SearchBackpressureSettings>,
    cancellations: AtomicU64,
}

impl CpuUsageTracker {
    #[must_use]
    pub fn new(settings: Arc<SearchBackpressureSettings>) -> Self {
        Self {
            settings,
            cancellations: AtomicU64::new(0),
        }
    }
}

impl ResourceUsageTracker for CpuUsageTracker {
    fn name(&self) -> TrackerName {
        TrackerName::CpuUsage
    }

    fn update(&self, _task: &dyn TaskHandle) {}

    fn cancellation_reason(&self, task: &dyn TaskHandle) -> Option<Verdict> {
        if task.cpu_time_nanos() < self.settings.search_task_cpu_time_threshold_nanos() {
            return None;
        }
        Some(Verdict {
            message: "cpu usage exceeded",
            score: 1,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_stats(&self, active_tasks: &[Arc<dyn TaskHandle>]) -> TrackerStats {
        TrackerStats::Cpu(max_and_avg(
            active_tasks.iter().map(|t| t.cpu_time_nanos() as f64),
        ))
    }

    fn cancellations_count(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    fn increment_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for CpuUsageTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuUsageTracker")
            .field("cancellations", &self.cancellations_count())
            .finish_non_exhaustive()
    }
}

// ─── Elapsed Time ───────────────────────────────────────────────────────────

/// Flags tasks that have been running longer than the configured threshold.
pub struct ElapsedTimeTracker {
    settings: Arc<SearchBackpressureSettings>,
    clock: Arc<dyn Clock>,
    cancellations: AtomicU64,
}

impl ElapsedTimeTracker {
    #[must_use]
    pub fn new(settings: Arc<SearchBackpressureSettings>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            cancellations: AtomicU64::new(0),
        }
    }

    fn elapsed_nanos(&self, task: &dyn TaskHandle) -> u64 {
        let elapsed = self.clock.now_nanos() - task.start_time_nanos();
        u64::try_from(elapsed).unwrap_or(0)
    }
}

impl ResourceUsageTracker for ElapsedTimeTracker {
    fn name(&self) -> TrackerName {
        TrackerName::ElapsedTime
    }

    fn update(&self, _task: &dyn TaskHandle) {}

    fn cancellation_reason(&self, task: &dyn TaskHandle) -> Option<Verdict> {
        if self.elapsed_nanos(task) < self.settings.search_task_elapsed_time_threshold_nanos() {
            return None;
        }
        Some(Verdict {
            message: "elapsed time exceeded",
            score: 1,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_stats(&self, active_tasks: &[Arc<dyn TaskHandle>]) -> TrackerStats {
        TrackerStats::ElapsedTime(max_and_avg(
            active_tasks
                .iter()
                .map(|t| self.elapsed_nanos(t.as_ref()) as f64),
        ))
    }

    fn cancellations_count(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    fn increment_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for ElapsedTimeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElapsedTimeTracker")
            .field("cancellations", &self.cancellations_count())
            .finish_non_exhaustive()
    }
}

// ─── Heap ───────────────────────────────────────────────────────────────────

/// Flags tasks using disproportionately more heap than their peers.
///
/// Maintains a rolling average of heap usage at completion time. A task
/// earns a verdict only once enough completions have been observed
/// ([`HEAP_MOVING_AVERAGE_WINDOW`]), and only when it exceeds both the
/// absolute per-task floor (a fraction of max heap) and `variance` times the
/// rolling average. The score is how many average tasks' worth of heap the
/// cancellation would reclaim.
pub struct HeapUsageTracker {
    settings: Arc<SearchBackpressureSettings>,
    max_heap_bytes: u64,
    moving_average: MovingAverage,
    cancellations: AtomicU64,
}

impl HeapUsageTracker {
    /// # Errors
    ///
    /// Propagates the moving-average window validation, which cannot fail
    /// for the built-in window size.
    pub fn new(
        settings: Arc<SearchBackpressureSettings>,
        max_heap_bytes: u64,
    ) -> BackpressureResult<Self> {
        Ok(Self {
            settings,
            max_heap_bytes,
            moving_average: MovingAverage::new(HEAP_MOVING_AVERAGE_WINDOW)?,
            cancellations: AtomicU64::new(0),
        })
    }

    /// Rolling average of heap usage at completion, in bytes.
    #[must_use]
    pub fn rolling_average(&self) -> f64 {
        self.moving_average.average()
    }

    /// Whether enough completions have been observed to produce verdicts.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.moving_average.ready()
    }
}

impl ResourceUsageTracker for HeapUsageTracker {
    fn name(&self) -> TrackerName {
        TrackerName::HeapUsage
    }

    fn update(&self, task: &dyn TaskHandle) {
        let heap = i64::try_from(task.heap_bytes()).unwrap_or(i64::MAX);
        self.moving_average.record(heap);
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    fn cancellation_reason(&self, task: &dyn TaskHandle) -> Option<Verdict> {
        if !self.moving_average.ready() {
            return None;
        }

        let task_heap = task.heap_bytes() as f64;
        let average_heap = self.moving_average.average();
        if average_heap <= 0.0 {
            return None;
        }

        let allowed_heap = average_heap * self.settings.search_task_heap_usage_variance();
        let per_task_floor =
            self.max_heap_bytes as f64 * self.settings.search_task_heap_usage_threshold();
        if task_heap < per_task_floor || task_heap < allowed_heap {
            return None;
        }

        let score = ((task_heap / average_heap) as u32).max(1);
        Some(Verdict {
            message: "heap usage exceeded",
            score,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_stats(&self, active_tasks: &[Arc<dyn TaskHandle>]) -> TrackerStats {
        let ResourceStats {
            current_max,
            current_avg,
        } = max_and_avg(active_tasks.iter().map(|t| t.heap_bytes() as f64));
        TrackerStats::Heap(HeapResourceStats {
            current_max,
            current_avg,
            rolling_avg: self.moving_average.average(),
        })
    }

    fn cancellations_count(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    fn increment_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for HeapUsageTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapUsageTracker")
            .field("max_heap_bytes", &self.max_heap_bytes)
            .field("rolling_avg", &self.moving_average.average())
            .field("ready", &self.moving_average.ready())
            .field("cancellations", &self.cancellations_count())
            .finish_non_exhaustive()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use searchbrake_core::clock::ManualClock;
    use searchbrake_core::error::BackpressureResult;
    use searchbrake_core::settings::SearchBackpressureConfig;
    use searchbrake_core::task::TaskKind;

    struct FixedTask {
        id: u64,
        cpu_nanos: u64,
        heap: u64,
        start_nanos: i64,
    }

    impl TaskHandle for FixedTask {
        fn id(&self) -> u64 {
            self.id
        }
        fn action(&self) -> &str {
            "indices:data/read/search[phase/query]"
        }
        fn kind(&self) -> TaskKind {
            TaskKind::SearchShard
        }
        fn cpu_time_nanos(&self) -> u64 {
            self.cpu_nanos
        }
        fn heap_bytes(&self) -> u64 {
            self.heap
        }
        fn start_time_nanos(&self) -> i64 {
            self.start_nanos
        }
        fn is_cancelled(&self) -> bool {
            false
        }
        fn cancel(&self, _reason: &str) -> BackpressureResult<()> {
            Ok(())
        }
    }

    fn task(id: u64, cpu_nanos: u64, heap: u64, start_nanos: i64) -> FixedTask {
        FixedTask {
            id,
            cpu_nanos,
            heap,
            start_nanos,
        }
    }

    fn default_settings() -> Arc<SearchBackpressureSettings> {
        Arc::new(SearchBackpressureSettings::new(SearchBackpressureConfig::default()).unwrap())
    }

    // ── Names ──

    #[test]
    fn tracker_names_are_stable() {
        assert_eq!(TrackerName::CpuUsage.as_str(), "cpu_usage_tracker");
        assert_eq!(TrackerName::HeapUsage.as_str(), "heap_usage_tracker");
        assert_eq!(TrackerName::ElapsedTime.to_string(), "elapsed_time_tracker");
    }

    #[test]
    fn tracker_name_serde_uses_wire_names() {
        let json = serde_json::to_string(&TrackerName::HeapUsage).unwrap();
        assert_eq!(json, "\"heap_usage_tracker\"");
    }

    // ── CPU ──

    #[test]
    fn cpu_tracker_flags_tasks_over_threshold() {
        let tracker = CpuUsageTracker::new(default_settings());
        // Default threshold is 15 ms.
        assert!(
            tracker
                .cancellation_reason(&task(1, 14_000_000, 0, 0))
                .is_none()
        );
        let verdict = tracker
            .cancellation_reason(&task(2, 15_000_000, 0, 0))
            .unwrap();
        assert_eq!(verdict.message, "cpu usage exceeded");
        assert_eq!(verdict.score, 1);
    }

    #[test]
    fn cpu_tracker_reads_dynamic_threshold() {
        let settings = default_settings();
        let tracker = CpuUsageTracker::new(Arc::clone(&settings));
        settings.set_search_task_cpu_time_threshold_ms(1);
        assert!(
            tracker
                .cancellation_reason(&task(1, 2_000_000, 0, 0))
                .is_some()
        );
    }

    #[test]
    fn cpu_tracker_stats_over_active_tasks() {
        let tracker = CpuUsageTracker::new(default_settings());
        let tasks: Vec<Arc<dyn TaskHandle>> = vec![
            Arc::new(task(1, 100, 0, 0)),
            Arc::new(task(2, 300, 0, 0)),
            Arc::new(task(3, 200, 0, 0)),
        ];
        let TrackerStats::Cpu(stats) = tracker.current_stats(&tasks) else {
            panic!("expected cpu stats");
        };
        assert!((stats.current_max - 300.0).abs() < f64::EPSILON);
        assert!((stats.current_avg - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_over_empty_task_set_are_zero() {
        let tracker = CpuUsageTracker::new(default_settings());
        let TrackerStats::Cpu(stats) = tracker.current_stats(&[]) else {
            panic!("expected cpu stats");
        };
        assert!(stats.current_max.abs() < f64::EPSILON);
        assert!(stats.current_avg.abs() < f64::EPSILON);
    }

    // ── Elapsed ──

    #[test]
    fn elapsed_tracker_flags_long_running_tasks() {
        let settings = default_settings();
        let clock = Arc::new(ManualClock::new(0));
        let tracker = ElapsedTimeTracker::new(settings, Arc::clone(&clock) as Arc<dyn Clock>);

        // Default threshold is 30 s.
        clock.set(29_000_000_000);
        assert!(tracker.cancellation_reason(&task(1, 0, 0, 0)).is_none());

        clock.set(30_000_000_000);
        let verdict = tracker.cancellation_reason(&task(1, 0, 0, 0)).unwrap();
        assert_eq!(verdict.message, "elapsed time exceeded");
        assert_eq!(verdict.score, 1);
    }

    #[test]
    fn elapsed_tracker_stats_use_the_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tracker = ElapsedTimeTracker::new(default_settings(), clock as Arc<dyn Clock>);
        let tasks: Vec<Arc<dyn TaskHandle>> =
            vec![Arc::new(task(1, 0, 0, 0)), Arc::new(task(2, 0, 0, 500))];
        let TrackerStats::ElapsedTime(stats) = tracker.current_stats(&tasks) else {
            panic!("expected elapsed stats");
        };
        assert!((stats.current_max - 1_000.0).abs() < f64::EPSILON);
        assert!((stats.current_avg - 750.0).abs() < f64::EPSILON);
    }

    #[test]
    fn elapsed_tracker_clamps_future_start_times() {
        let clock = Arc::new(ManualClock::new(0));
        let tracker = ElapsedTimeTracker::new(default_settings(), clock as Arc<dyn Clock>);
        let tasks: Vec<Arc<dyn TaskHandle>> = vec![Arc::new(task(1, 0, 0, 10_000))];
        let TrackerStats::ElapsedTime(stats) = tracker.current_stats(&tasks) else {
            panic!("expected elapsed stats");
        };
        assert!(stats.current_max.abs() < f64::EPSILON);
    }

    // ── Heap ──

    fn heap_tracker(max_heap_bytes: u64) -> HeapUsageTracker {
        HeapUsageTracker::new(default_settings(), max_heap_bytes).unwrap()
    }

    fn warm_up(tracker: &HeapUsageTracker, samples: usize, heap: u64) {
        for i in 0..samples {
            tracker.update(&task(1_000 + i as u64, 0, heap, 0));
        }
    }

    #[test]
    fn heap_tracker_has_no_opinion_before_warm_up() {
        let tracker = heap_tracker(1_000_000);
        warm_up(&tracker, HEAP_MOVING_AVERAGE_WINDOW - 1, 100);
        assert!(!tracker.ready());
        assert!(
            tracker
                .cancellation_reason(&task(1, 0, 10_000, 0))
                .is_none()
        );
    }

    #[test]
    fn heap_tracker_scores_by_multiples_of_average() {
        let tracker = heap_tracker(1_000_000);
        warm_up(&tracker, HEAP_MOVING_AVERAGE_WINDOW, 100);
        assert!(tracker.ready());

        // floor = 0.005 * 1_000_000 = 5_000; allowed = 2.0 * 100 = 200.
        let verdict = tracker.cancellation_reason(&task(1, 0, 10_000, 0)).unwrap();
        assert_eq!(verdict.message, "heap usage exceeded");
        assert_eq!(verdict.score, 100);
    }

    #[test]
    fn heap_tracker_respects_per_task_floor() {
        let tracker = heap_tracker(1_000_000);
        warm_up(&tracker, HEAP_MOVING_AVERAGE_WINDOW, 100);
        // 4_999 is above the variance allowance but under the 5_000 floor.
        assert!(tracker.cancellation_reason(&task(1, 0, 4_999, 0)).is_none());
    }

    #[test]
    fn heap_tracker_respects_variance_allowance() {
        let settings = default_settings();
        settings.set_search_task_heap_usage_threshold(0.0).unwrap();
        let tracker = HeapUsageTracker::new(settings, 1_000_000).unwrap();
        warm_up(&tracker, HEAP_MOVING_AVERAGE_WINDOW, 100);
        // Floor disabled; 199 < 2.0 * 100 stays allowed, 200 does not.
        assert!(tracker.cancellation_reason(&task(1, 0, 199, 0)).is_none());
        assert!(tracker.cancellation_reason(&task(1, 0, 200, 0)).is_some());
    }

    #[test]
    fn heap_tracker_score_is_at_least_one() {
        let settings = default_settings();
        settings.set_search_task_heap_usage_threshold(0.0).unwrap();
        settings.set_search_task_heap_usage_variance(0.5).unwrap();
        let tracker = HeapUsageTracker::new(settings, 1_000_000).unwrap();
        warm_up(&tracker, HEAP_MOVING_AVERAGE_WINDOW, 100);
        // 60 bytes is over the 50-byte allowance but well under one average.
        let verdict = tracker.cancellation_reason(&task(1, 0, 60, 0)).unwrap();
        assert_eq!(verdict.score, 1);
    }

    #[test]
    fn heap_tracker_ignores_zero_average() {
        let tracker = heap_tracker(0);
        warm_up(&tracker, HEAP_MOVING_AVERAGE_WINDOW, 0);
        assert!(tracker.ready());
        assert!(tracker.cancellation_reason(&task(1, 0, 100, 0)).is_none());
    }

    #[test]
    fn heap_tracker_stats_include_rolling_average() {
        let tracker = heap_tracker(1_000_000);
        warm_up(&tracker, 10, 100);
        let tasks: Vec<Arc<dyn TaskHandle>> =
            vec![Arc::new(task(1, 0, 400, 0)), Arc::new(task(2, 0, 200, 0))];
        let TrackerStats::Heap(stats) = tracker.current_stats(&tasks) else {
            panic!("expected heap stats");
        };
        assert!((stats.current_max - 400.0).abs() < f64::EPSILON);
        assert!((stats.current_avg - 300.0).abs() < f64::EPSILON);
        assert!((stats.rolling_avg - 100.0).abs() < f64::EPSILON);
    }

    // ── Cancellation counters ──

    #[test]
    fn cancellation_counters_are_monotonic() {
        let tracker = CpuUsageTracker::new(default_settings());
        assert_eq!(tracker.cancellations_count(), 0);
        tracker.increment_cancellations();
        tracker.increment_cancellations();
        assert_eq!(tracker.cancellations_count(), 2);
    }

    #[test]
    fn trackers_are_object_safe() {
        let settings = default_settings();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let trackers: Vec<Arc<dyn ResourceUsageTracker>> = vec![
            Arc::new(CpuUsageTracker::new(Arc::clone(&settings))),
            Arc::new(HeapUsageTracker::new(Arc::clone(&settings), 1_000).unwrap()),
            Arc::new(ElapsedTimeTracker::new(settings, clock)),
        ];
        let names: Vec<_> = trackers.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                TrackerName::CpuUsage,
                TrackerName::HeapUsage,
                TrackerName::ElapsedTime
            ]
        );
    }
}
