//! The periodic backpressure control loop.
//!
//! [`SearchBackpressureController`] watches node CPU and heap pressure
//! through injected sensors, detects sustained duress via consecutive-breach
//! streaks, and, while the node is in duress, cancels the live search shard
//! tasks most responsible for heap pressure, throttled by two token buckets
//! (one on wall time, one on the completed-task counter).
//!
//! All failures inside a tick are contained within that tick: sensor
//! outages count as "not breached", stats-refresh failures leave the loop on
//! stale stats, and a failed cancel signal moves on to the next candidate.
//! The periodic schedule itself is never disrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use searchbrake_core::clock::Clock;
use searchbrake_core::error::BackpressureResult;
use searchbrake_core::scheduler::{ScheduleHandle, Scheduler};
use searchbrake_core::sensors::ResourceSensors;
use searchbrake_core::settings::SearchBackpressureSettings;
use searchbrake_core::streak::Streak;
use searchbrake_core::task::{TaskCompletionListener, TaskHandle, TaskKind, TaskRegistry};
use searchbrake_core::token_bucket::{BucketClock, TokenBucket};

use crate::cancellation::{CancellationReason, TaskCancellation};
use crate::stats::{
    CancellationSection, CancellationStats, CancelledTaskStats, CurrentStats,
    SearchBackpressureStats, ShardTaskCurrentStats,
};
use crate::trackers::{
    CpuUsageTracker, ElapsedTimeTracker, HeapUsageTracker, ResourceUsageTracker, TrackerStats,
};

/// Node-local search backpressure controller.
///
/// Construction wires the controller into the task registry's completion
/// callbacks; call [`Self::start`] to begin periodic ticks and
/// [`Self::shutdown`] to stop them. `tick` is also callable directly, which
/// is how the scheduler and the tests drive it.
pub struct SearchBackpressureController {
    settings: Arc<SearchBackpressureSettings>,
    registry: Arc<dyn TaskRegistry>,
    sensors: Arc<dyn ResourceSensors>,
    clock: Arc<dyn Clock>,
    trackers: Vec<Arc<dyn ResourceUsageTracker>>,
    max_heap_bytes: u64,

    cpu_breaches: Streak,
    heap_breaches: Streak,

    completed_task_count: Arc<AtomicU64>,
    cancellation_count: AtomicU64,
    limit_reached_count: AtomicU64,
    last_cancelled_task: Mutex<Option<CancelledTaskStats>>,

    time_bucket: TokenBucket,
    completion_bucket: TokenBucket,

    schedule: Mutex<Option<Box<dyn ScheduleHandle>>>,
}

impl SearchBackpressureController {
    /// Create a controller with the standard CPU, heap, and elapsed-time
    /// trackers, and register it for task completion callbacks.
    ///
    /// # Errors
    ///
    /// Returns an invalid-config error when the cancellation
    /// budget parameters fail token-bucket validation.
    pub fn new(
        settings: Arc<SearchBackpressureSettings>,
        registry: Arc<dyn TaskRegistry>,
        sensors: Arc<dyn ResourceSensors>,
        clock: Arc<dyn Clock>,
    ) -> BackpressureResult<Arc<Self>> {
        let max_heap_bytes = sensors.max_heap_bytes();
        let trackers: Vec<Arc<dyn ResourceUsageTracker>> = vec![
            Arc::new(CpuUsageTracker::new(Arc::clone(&settings))),
            Arc::new(HeapUsageTracker::new(
                Arc::clone(&settings),
                max_heap_bytes,
            )?),
            Arc::new(ElapsedTimeTracker::new(
                Arc::clone(&settings),
                Arc::clone(&clock),
            )),
        ];
        Self::with_trackers(settings, registry, sensors, clock, trackers)
    }

    /// Create a controller with an explicit tracker list.
    ///
    /// # Errors
    ///
    /// Returns an invalid-config error when the cancellation
    /// budget parameters fail token-bucket validation.
    pub fn with_trackers(
        settings: Arc<SearchBackpressureSettings>,
        registry: Arc<dyn TaskRegistry>,
        sensors: Arc<dyn ResourceSensors>,
        clock: Arc<dyn Clock>,
        trackers: Vec<Arc<dyn ResourceUsageTracker>>,
    ) -> BackpressureResult<Arc<Self>> {
        let max_heap_bytes = sensors.max_heap_bytes();
        let completed_task_count = Arc::new(AtomicU64::new(0));

        let time_clock: BucketClock = {
            let clock = Arc::clone(&clock);
            Arc::new(move || clock.now_nanos())
        };
        let time_bucket = TokenBucket::new(
            time_clock,
            settings.cancellation_rate_nanos(),
            settings.cancellation_burst(),
        )?;

        let completion_clock: BucketClock = {
            let completed = Arc::clone(&completed_task_count);
            Arc::new(move || {
                i64::try_from(completed.load(Ordering::Acquire)).unwrap_or(i64::MAX)
            })
        };
        let completion_bucket = TokenBucket::new(
            completion_clock,
            settings.cancellation_ratio(),
            settings.cancellation_burst(),
        )?;

        let controller = Arc::new(Self {
            settings,
            registry: Arc::clone(&registry),
            sensors,
            clock,
            trackers,
            max_heap_bytes,
            cpu_breaches: Streak::new(),
            heap_breaches: Streak::new(),
            completed_task_count,
            cancellation_count: AtomicU64::new(0),
            limit_reached_count: AtomicU64::new(0),
            last_cancelled_task: Mutex::new(None),
            time_bucket,
            completion_bucket,
            schedule: Mutex::new(None),
        });

        registry
            .add_completion_listener(Arc::clone(&controller) as Arc<dyn TaskCompletionListener>);
        Ok(controller)
    }

    /// Begin periodic ticks at the configured interval. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates scheduler-unavailable errors from the
    /// scheduler.
    pub fn start(self: &Arc<Self>, scheduler: &dyn Scheduler) -> BackpressureResult<()> {
        let mut schedule = lock_or_recover(&self.schedule);
        if schedule.is_some() {
            return Ok(());
        }
        let controller = Arc::clone(self);
        let handle =
            scheduler.schedule_fixed_delay(self.settings.interval(), Box::new(move || {
                controller.tick();
            }))?;
        *schedule = Some(handle);
        Ok(())
    }

    /// Cancel the periodic schedule. Idempotent; an in-flight tick completes.
    pub fn shutdown(&self) {
        let handle = lock_or_recover(&self.schedule).take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// One iteration of the control loop.
    pub fn tick(&self) {
        if !self.settings.enabled() {
            return;
        }

        if !self.is_node_in_duress() {
            return;
        }

        let tasks = self.registry.live_search_shard_tasks();
        if let Err(error) = self.registry.refresh_stats(&tasks) {
            warn!(
                target: "searchbrake.controller",
                error = %error,
                "task stats refresh failed; proceeding with stale stats"
            );
        }

        // Skip cancellation when the heap growth is not search-driven.
        let search_heap_bytes: u64 = tasks.iter().map(|task| task.heap_bytes()).sum();
        let search_heap_floor = self.search_heap_floor_bytes();
        if search_heap_bytes < search_heap_floor {
            debug!(
                target: "searchbrake.controller",
                search_heap_bytes,
                search_heap_floor,
                "node in duress but search tasks hold too little heap; skipping"
            );
            return;
        }

        for candidate in self.task_cancellations(&tasks) {
            info!(
                target: "searchbrake.controller",
                task_id = candidate.task().id(),
                action = candidate.task().action(),
                score = candidate.total_score(),
                reasons = %candidate.reason_string(),
                "task exceeds resource limits; marking for cancellation"
            );

            if !self.settings.enforced() {
                continue;
            }

            let ok_time = self.time_bucket.request();
            let ok_ratio = self.completion_bucket.request();
            if !ok_time && !ok_ratio {
                self.limit_reached_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "searchbrake.controller",
                    "cancellation budget exhausted in both buckets; stopping"
                );
                break;
            }

            match candidate.cancel(self.clock.as_ref()) {
                Ok(snapshot) => {
                    *lock_or_recover(&self.last_cancelled_task) = Some(snapshot);
                    self.cancellation_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    warn!(
                        target: "searchbrake.controller",
                        task_id = candidate.task().id(),
                        error = %error,
                        "failed to cancel task; moving to next candidate"
                    );
                }
            }
        }
    }

    /// Whether the node is currently under sustained duress.
    ///
    /// Reads both sensors and records one observation on each breach streak.
    /// A failing sensor counts as "not breached" for that dimension and
    /// never affects the other.
    pub fn is_node_in_duress(&self) -> bool {
        let cpu_breached = match self.sensors.cpu_utilization() {
            Ok(cpu) => cpu >= self.settings.node_duress_cpu_threshold(),
            Err(error) => {
                debug!(
                    target: "searchbrake.controller",
                    sensor = "cpu",
                    error = %error,
                    "sensor unavailable; treating observation as not breached"
                );
                false
            }
        };
        let heap_breached = match self.sensors.heap_used_fraction() {
            Ok(heap) => heap >= self.settings.node_duress_heap_threshold(),
            Err(error) => {
                debug!(
                    target: "searchbrake.controller",
                    sensor = "heap",
                    error = %error,
                    "sensor unavailable; treating observation as not breached"
                );
                false
            }
        };

        let required = self.settings.num_consecutive_breaches() as usize;
        let cpu_streak = self.cpu_breaches.record(cpu_breached);
        let heap_streak = self.heap_breaches.record(heap_breached);
        cpu_streak >= required || heap_streak >= required
    }

    /// Point-in-time observability snapshot. No side effects.
    #[must_use]
    pub fn stats(&self) -> SearchBackpressureStats {
        let tasks = self.registry.live_search_shard_tasks();

        let mut current = ShardTaskCurrentStats::default();
        let mut breakup = std::collections::BTreeMap::new();
        for tracker in &self.trackers {
            match tracker.current_stats(&tasks) {
                TrackerStats::Cpu(stats) => current.cpu_usage_tracker = stats,
                TrackerStats::Heap(stats) => current.heap_usage_tracker = stats,
                TrackerStats::ElapsedTime(stats) => current.elapsed_time_tracker = stats,
            }
            breakup.insert(tracker.name(), tracker.cancellations_count());
        }

        SearchBackpressureStats {
            current_stats: CurrentStats {
                search_shard_task: current,
            },
            cancellation_stats: CancellationSection {
                search_shard_task: CancellationStats {
                    cancellation_count: self.cancellation_count.load(Ordering::Relaxed),
                    cancellation_breakup: breakup,
                    cancellation_limit_reached_count: self
                        .limit_reached_count
                        .load(Ordering::Relaxed),
                    last_cancelled_task: *lock_or_recover(&self.last_cancelled_task),
                },
            },
            enabled: self.settings.enabled(),
            enforced: self.settings.enforced(),
        }
    }

    /// Total tasks cancelled since startup.
    #[must_use]
    pub fn cancellation_count(&self) -> u64 {
        self.cancellation_count.load(Ordering::Relaxed)
    }

    /// Times a tick stopped early on an exhausted cancellation budget.
    #[must_use]
    pub fn limit_reached_count(&self) -> u64 {
        self.limit_reached_count.load(Ordering::Relaxed)
    }

    /// Completed (non-cancelled) search shard tasks observed. Monotonic;
    /// doubles as the completion bucket's clock.
    #[must_use]
    pub fn completed_task_count(&self) -> u64 {
        self.completed_task_count.load(Ordering::Acquire)
    }

    /// Usage snapshot of the most recently cancelled task.
    #[must_use]
    pub fn last_cancelled_task(&self) -> Option<CancelledTaskStats> {
        *lock_or_recover(&self.last_cancelled_task)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)]
    fn search_heap_floor_bytes(&self) -> u64 {
        let floor = self.max_heap_bytes as f64 * self.settings.search_heap_usage_threshold();
        floor.max(0.0) as u64
    }

    /// Ranked cancellation plan: eligible tasks sorted by descending total
    /// score (ties on ascending id).
    fn task_cancellations(&self, tasks: &[Arc<dyn TaskHandle>]) -> Vec<TaskCancellation> {
        let mut plan: Vec<TaskCancellation> = tasks
            .iter()
            .map(|task| self.bundle_verdicts(task))
            .filter(TaskCancellation::is_eligible)
            .collect();
        plan.sort();
        plan
    }

    fn bundle_verdicts(&self, task: &Arc<dyn TaskHandle>) -> TaskCancellation {
        let reasons: Vec<CancellationReason> = self
            .trackers
            .iter()
            .filter_map(|tracker| {
                tracker
                    .cancellation_reason(task.as_ref())
                    .map(|verdict| CancellationReason::new(Arc::clone(tracker), verdict))
            })
            .collect();
        TaskCancellation::new(Arc::clone(task), reasons)
    }
}

impl TaskCompletionListener for SearchBackpressureController {
    fn on_task_completed(&self, task: &Arc<dyn TaskHandle>) {
        if task.kind() != TaskKind::SearchShard {
            return;
        }

        if !task.is_cancelled() {
            self.completed_task_count.fetch_add(1, Ordering::AcqRel);
        }

        for tracker in &self.trackers {
            tracker.update(task.as_ref());
        }
    }
}

impl std::fmt::Debug for SearchBackpressureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchBackpressureController")
            .field("max_heap_bytes", &self.max_heap_bytes)
            .field("cpu_breaches", &self.cpu_breaches.length())
            .field("heap_breaches", &self.heap_breaches.length())
            .field("completed_task_count", &self.completed_task_count())
            .field("cancellation_count", &self.cancellation_count())
            .field("limit_reached_count", &self.limit_reached_count())
            .finish_non_exhaustive()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
