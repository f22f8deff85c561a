//! End-to-end controller scenarios with deterministic sensors, clock, and
//! task registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use searchbrake::{
    BackpressureError, BackpressureResult, Clock, HEAP_MOVING_AVERAGE_WINDOW, HeapUsageTracker,
    ManualClock, ResourceSensors, ResourceUsageTracker, SearchBackpressureConfig,
    SearchBackpressureController, SearchBackpressureSettings, TaskCompletionListener, TaskHandle,
    TaskKind, TaskRegistry,
};

const NANOS_PER_SEC: i64 = 1_000_000_000;
const MIB: u64 = 1024 * 1024;

// ─── Fixtures ───────────────────────────────────────────────────────────────

struct ScriptedTask {
    id: u64,
    kind: TaskKind,
    cpu_nanos: u64,
    heap: u64,
    start_nanos: i64,
    cancelled: AtomicBool,
}

impl ScriptedTask {
    fn search(id: u64, cpu_nanos: u64, heap: u64, start_nanos: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind: TaskKind::SearchShard,
            cpu_nanos,
            heap,
            start_nanos,
            cancelled: AtomicBool::new(false),
        })
    }
}

impl TaskHandle for ScriptedTask {
    fn id(&self) -> u64 {
        self.id
    }
    fn action(&self) -> &str {
        "indices:data/read/search[phase/query]"
    }
    fn kind(&self) -> TaskKind {
        self.kind
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
        self.cancelled.load(Ordering::Acquire)
    }
    fn cancel(&self, _reason: &str) -> BackpressureResult<()> {
        self.cancelled.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedRegistry {
    tasks: Mutex<Vec<Arc<dyn TaskHandle>>>,
    listeners: Mutex<Vec<Arc<dyn TaskCompletionListener>>>,
}

impl ScriptedRegistry {
    fn set_tasks(&self, tasks: Vec<Arc<dyn TaskHandle>>) {
        *self.tasks.lock().unwrap() = tasks;
    }

    /// Deliver a completion through the registered listeners, the way the
    /// execution engine would.
    fn complete(&self, task: &Arc<dyn TaskHandle>) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.on_task_completed(task);
        }
    }
}

impl TaskRegistry for ScriptedRegistry {
    fn live_search_shard_tasks(&self) -> Vec<Arc<dyn TaskHandle>> {
        self.tasks.lock().unwrap().clone()
    }

    fn refresh_stats(&self, _tasks: &[Arc<dyn TaskHandle>]) -> BackpressureResult<()> {
        Ok(())
    }

    fn add_completion_listener(&self, listener: Arc<dyn TaskCompletionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }
}

struct ScriptedSensors {
    cpu: AtomicU64,
    heap: AtomicU64,
    max_heap_bytes: u64,
}

impl ScriptedSensors {
    fn new(max_heap_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            cpu: AtomicU64::new(0.0_f64.to_bits()),
            heap: AtomicU64::new(0.0_f64.to_bits()),
            max_heap_bytes,
        })
    }

    fn set_cpu(&self, value: f64) {
        self.cpu.store(value.to_bits(), Ordering::Release);
    }
}

impl ResourceSensors for ScriptedSensors {
    fn cpu_utilization(&self) -> BackpressureResult<f64> {
        Ok(f64::from_bits(self.cpu.load(Ordering::Acquire)))
    }

    fn heap_used_fraction(&self) -> BackpressureResult<f64> {
        Ok(f64::from_bits(self.heap.load(Ordering::Acquire)))
    }

    fn max_heap_bytes(&self) -> u64 {
        self.max_heap_bytes
    }
}

struct Harness {
    controller: Arc<SearchBackpressureController>,
    registry: Arc<ScriptedRegistry>,
    sensors: Arc<ScriptedSensors>,
    clock: Arc<ManualClock>,
}

fn harness(config: SearchBackpressureConfig, max_heap_bytes: u64) -> Harness {
    let settings = Arc::new(SearchBackpressureSettings::new(config).unwrap());
    let registry = Arc::new(ScriptedRegistry::default());
    let sensors = ScriptedSensors::new(max_heap_bytes);
    let clock = Arc::new(ManualClock::new(0));
    let controller = SearchBackpressureController::new(
        settings,
        Arc::clone(&registry) as Arc<dyn TaskRegistry>,
        Arc::clone(&sensors) as Arc<dyn ResourceSensors>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .unwrap();
    Harness {
        controller,
        registry,
        sensors,
        clock,
    }
}

// ─── Scenario 1: no duress, no action ───────────────────────────────────────

#[test]
fn quiet_node_never_cancels() {
    let h = harness(SearchBackpressureConfig::default(), 10 * 1024 * MIB);

    for i in 0..100 {
        let task: Arc<dyn TaskHandle> =
            ScriptedTask::search(i, NANOS_PER_SEC as u64, MIB, 0);
        h.registry.complete(&task);
    }
    for _ in 0..100 {
        h.controller.tick();
    }

    assert_eq!(h.controller.cancellation_count(), 0);
    assert_eq!(h.controller.limit_reached_count(), 0);
    assert_eq!(h.controller.completed_task_count(), 100);
}

// ─── Scenario 2: duress streak crossing the threshold ───────────────────────

#[test]
fn duress_fires_on_the_third_consecutive_breach() {
    let h = harness(SearchBackpressureConfig::default(), 10 * 1024 * MIB);
    h.sensors.set_cpu(1.0);

    assert!(!h.controller.is_node_in_duress());
    assert!(!h.controller.is_node_in_duress());
    assert!(h.controller.is_node_in_duress());
}

// ─── Scenario 3: search-heap guard ──────────────────────────────────────────

#[test]
fn heap_guard_blocks_cancellation_when_search_is_not_the_cause() {
    // Floor = 0.05 * 200 MiB = 10 MiB; search tasks hold one byte.
    let h = harness(
        SearchBackpressureConfig {
            node_duress_num_consecutive_breaches: 1,
            ..Default::default()
        },
        200 * MIB,
    );
    h.sensors.set_cpu(1.0);
    let task = ScriptedTask::search(1, 10 * NANOS_PER_SEC as u64, 1, 0);
    h.registry
        .set_tasks(vec![Arc::clone(&task) as Arc<dyn TaskHandle>]);

    h.controller.tick();

    assert!(!task.is_cancelled());
    assert_eq!(h.controller.cancellation_count(), 0);
}

// ─── Scenario 4: ranking under an exhausted budget ──────────────────────────

#[test]
fn highest_scoring_task_is_cancelled_first_when_budget_allows_one() {
    let h = harness(
        SearchBackpressureConfig {
            node_duress_num_consecutive_breaches: 1,
            cancellation_burst: 1.0,
            ..Default::default()
        },
        1_000,
    );
    h.sensors.set_cpu(1.0);
    h.clock.set(60 * NANOS_PER_SEC);

    // All three exceed the CPU threshold (score 1); the third has also been
    // running past the elapsed-time threshold (score 2).
    let short_a = ScriptedTask::search(1, NANOS_PER_SEC as u64, 100, 59 * NANOS_PER_SEC);
    let short_b = ScriptedTask::search(2, NANOS_PER_SEC as u64, 100, 59 * NANOS_PER_SEC);
    let long_runner = ScriptedTask::search(3, NANOS_PER_SEC as u64, 100, 0);
    h.registry.set_tasks(vec![
        Arc::clone(&short_a) as Arc<dyn TaskHandle>,
        Arc::clone(&short_b) as Arc<dyn TaskHandle>,
        Arc::clone(&long_runner) as Arc<dyn TaskHandle>,
    ]);

    h.controller.tick();

    // With zero completions the budget admits exactly one cancellation, and
    // it must be the score-2 task.
    assert!(long_runner.is_cancelled());
    assert!(!short_a.is_cancelled());
    assert!(!short_b.is_cancelled());
    assert_eq!(h.controller.cancellation_count(), 1);
    assert_eq!(h.controller.limit_reached_count(), 1);
}

// ─── Scenario 5: heap moving-average warm-up ────────────────────────────────

#[test]
fn heap_tracker_warms_up_before_producing_verdicts() {
    let settings = Arc::new(
        SearchBackpressureSettings::new(SearchBackpressureConfig::default()).unwrap(),
    );
    let tracker = HeapUsageTracker::new(settings, 1_000_000).unwrap();
    let probe = ScriptedTask::search(0, 0, 10_000, 0);

    for i in 0..(HEAP_MOVING_AVERAGE_WINDOW - 1) {
        let sample = ScriptedTask::search(1 + i as u64, 0, 100, 0);
        tracker.update(sample.as_ref());
    }
    assert!(tracker.cancellation_reason(probe.as_ref()).is_none());

    let last = ScriptedTask::search(HEAP_MOVING_AVERAGE_WINDOW as u64, 0, 100, 0);
    tracker.update(last.as_ref());

    let verdict = tracker.cancellation_reason(probe.as_ref()).unwrap();
    assert_eq!(verdict.score, 100);
}

// ─── Scenario 6: dual-bucket throttling ─────────────────────────────────────

#[test]
fn dual_buckets_throttle_cancellations_across_ticks() {
    // Rate 3e-9 tokens/ns is 3 per second; burst 10.
    let h = harness(
        SearchBackpressureConfig {
            node_duress_num_consecutive_breaches: 1,
            ..Default::default()
        },
        1_000,
    );
    h.sensors.set_cpu(1.0);

    let tasks: Vec<Arc<ScriptedTask>> = (1..=50)
        .map(|id| ScriptedTask::search(id, NANOS_PER_SEC as u64, 100, 0))
        .collect();
    h.registry.set_tasks(
        tasks
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn TaskHandle>)
            .collect(),
    );

    // First tick: the time bucket's burst admits ten cancellations.
    h.controller.tick();
    assert_eq!(h.controller.cancellation_count(), 10);
    assert_eq!(h.controller.limit_reached_count(), 1);

    // One second later three more tokens have accrued; no completions, so
    // the ratio bucket stays empty.
    h.clock.advance(NANOS_PER_SEC);
    h.controller.tick();
    assert_eq!(h.controller.cancellation_count(), 13);
    assert_eq!(h.controller.limit_reached_count(), 2);

    let cancelled = tasks.iter().filter(|t| t.is_cancelled()).count();
    assert_eq!(cancelled, 13);
}

// ─── Completions refill the ratio bucket ────────────────────────────────────

#[test]
fn completions_grant_additional_cancellation_budget() {
    let h = harness(
        SearchBackpressureConfig {
            node_duress_num_consecutive_breaches: 1,
            cancellation_burst: 1.0,
            ..Default::default()
        },
        1_000,
    );
    h.sensors.set_cpu(1.0);

    let tasks: Vec<Arc<ScriptedTask>> = (1..=5)
        .map(|id| ScriptedTask::search(id, NANOS_PER_SEC as u64, 100, 0))
        .collect();
    h.registry.set_tasks(
        tasks
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn TaskHandle>)
            .collect(),
    );

    h.controller.tick();
    assert_eq!(h.controller.cancellation_count(), 1);

    // Ten completions at ratio 0.1 accrue one ratio token.
    for i in 0..10 {
        let done: Arc<dyn TaskHandle> = ScriptedTask::search(100 + i, 0, 100, 0);
        h.registry.complete(&done);
    }
    h.controller.tick();
    assert_eq!(h.controller.cancellation_count(), 2);
}

// ─── Observability ──────────────────────────────────────────────────────────

#[test]
fn stats_snapshot_has_the_documented_wire_shape() {
    let h = harness(
        SearchBackpressureConfig {
            node_duress_num_consecutive_breaches: 1,
            ..Default::default()
        },
        1_000,
    );
    h.sensors.set_cpu(1.0);
    let task = ScriptedTask::search(1, NANOS_PER_SEC as u64, 100, 0);
    h.registry
        .set_tasks(vec![Arc::clone(&task) as Arc<dyn TaskHandle>]);
    h.controller.tick();

    let value = h.controller.stats().to_node_stats_json();
    let root = &value["search_backpressure"];

    let shard = &root["current_stats"]["search_shard_task"];
    assert!(shard["cpu_usage_tracker"]["current_max"].is_number());
    assert!(shard["heap_usage_tracker"]["rolling_avg"].is_number());
    assert!(shard["elapsed_time_tracker"]["current_avg"].is_number());

    let cancellation = &root["cancellation_stats"]["search_shard_task"];
    assert_eq!(cancellation["cancellation_count"], 1);
    assert_eq!(cancellation["cancellation_breakup"]["cpu_usage_tracker"], 1);
    assert_eq!(cancellation["cancellation_limit_reached_count"], 0);
    assert_eq!(
        cancellation["last_cancelled_task"]["cpu_usage_nanos"],
        NANOS_PER_SEC
    );

    assert_eq!(root["enabled"], true);
    assert_eq!(root["enforced"], true);
}

#[test]
fn reading_stats_repeatedly_changes_nothing() {
    let h = harness(SearchBackpressureConfig::default(), 1_000);
    for _ in 0..10 {
        let _ = h.controller.stats();
    }
    assert_eq!(h.controller.cancellation_count(), 0);
    assert_eq!(h.controller.completed_task_count(), 0);
    let snapshot = h.controller.stats();
    assert_eq!(
        snapshot
            .cancellation_stats
            .search_shard_task
            .cancellation_count,
        0
    );
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

#[test]
fn start_and_shutdown_are_idempotent() {
    use searchbrake::FixedDelayScheduler;

    let h = harness(
        SearchBackpressureConfig {
            interval_ms: 5,
            ..Default::default()
        },
        1_000,
    );
    let scheduler = FixedDelayScheduler::new();

    h.controller.start(&scheduler).unwrap();
    h.controller.start(&scheduler).unwrap();

    // Quiet sensors: ticks run but never act.
    std::thread::sleep(std::time::Duration::from_millis(25));
    assert_eq!(h.controller.cancellation_count(), 0);

    h.controller.shutdown();
    h.controller.shutdown();
}

// ─── Error type sanity across the seams ─────────────────────────────────────

#[test]
fn seam_errors_render_actionable_messages() {
    let err = BackpressureError::StatsRefreshFailed {
        source: Box::new(std::io::Error::other("engine busy")),
    };
    assert!(err.to_string().contains("engine busy"));
}
