//! Observability snapshot for the backpressure controller.
//!
//! Field names are stable: consumers key on them when rendering node stats.
//! The snapshot nests under a top-level `search_backpressure` object via
//! [`SearchBackpressureStats::to_node_stats_json`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::trackers::{HeapResourceStats, ResourceStats, TrackerName};

/// Resource usage of the most recently cancelled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledTaskStats {
    /// Cumulative heap bytes the task had allocated.
    pub heap_usage_bytes: u64,
    /// Cumulative CPU nanoseconds the task had consumed.
    pub cpu_usage_nanos: u64,
    /// Wall time from task start to cancellation, in nanoseconds.
    pub elapsed_time_nanos: u64,
}

/// Per-tracker stats over the live search shard task set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ShardTaskCurrentStats {
    pub cpu_usage_tracker: ResourceStats,
    pub heap_usage_tracker: HeapResourceStats,
    pub elapsed_time_tracker: ResourceStats,
}

/// `current_stats` section of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentStats {
    pub search_shard_task: ShardTaskCurrentStats,
}

/// Cumulative cancellation counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CancellationStats {
    /// Total tasks cancelled since startup.
    pub cancellation_count: u64,
    /// Cancellations attributed to each tracker. A cancellation with
    /// multiple contributing trackers counts once per tracker.
    pub cancellation_breakup: BTreeMap<TrackerName, u64>,
    /// Times a tick stopped early because both cancellation buckets were
    /// empty.
    pub cancellation_limit_reached_count: u64,
    /// Usage snapshot of the most recently cancelled task, if any.
    pub last_cancelled_task: Option<CancelledTaskStats>,
}

/// `cancellation_stats` section of the snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CancellationSection {
    pub search_shard_task: CancellationStats,
}

/// Full point-in-time snapshot of the controller.
///
/// Produced by `SearchBackpressureController::stats`; reading it has no side
/// effects on any counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchBackpressureStats {
    pub current_stats: CurrentStats,
    pub cancellation_stats: CancellationSection,
    pub enabled: bool,
    pub enforced: bool,
}

impl SearchBackpressureStats {
    /// Render the node-stats envelope: the snapshot nested under a
    /// `search_backpressure` key.
    #[must_use]
    pub fn to_node_stats_json(&self) -> serde_json::Value {
        serde_json::json!({ "search_backpressure": self })
    }
}
