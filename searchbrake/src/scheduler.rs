//! Thread-backed fixed-delay scheduler for the control loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use searchbrake_core::error::{BackpressureError, BackpressureResult};
use searchbrake_core::scheduler::{ScheduleHandle, Scheduler};

/// Runs each schedule on its own named worker thread.
///
/// The delay is measured from the end of one tick to the start of the next
/// (fixed delay, not fixed rate), so a slow tick never causes overlapping
/// executions. Cancellation wakes the worker immediately; an in-flight tick
/// completes before the worker exits.
#[derive(Debug, Default)]
pub struct FixedDelayScheduler;

impl FixedDelayScheduler {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[derive(Default)]
struct ScheduleState {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

struct ThreadScheduleHandle {
    state: Arc<ScheduleState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler for FixedDelayScheduler {
    fn schedule_fixed_delay(
        &self,
        interval: Duration,
        tick: Box<dyn Fn() + Send>,
    ) -> BackpressureResult<Box<dyn ScheduleHandle>> {
        let state = Arc::new(ScheduleState::default());
        let worker_state = Arc::clone(&state);

        let worker = thread::Builder::new()
            .name("searchbrake-tick".to_owned())
            .spawn(move || run_schedule_loop(&worker_state, interval, tick.as_ref()))
            .map_err(|error| BackpressureError::SchedulerUnavailable {
                reason: format!("failed to spawn tick worker: {error}"),
            })?;

        Ok(Box::new(ThreadScheduleHandle {
            state,
            worker: Mutex::new(Some(worker)),
        }))
    }
}

fn run_schedule_loop(state: &ScheduleState, interval: Duration, tick: &(dyn Fn() + Send)) {
    let mut cancelled = lock_cancelled(state);
    loop {
        // Fixed delay between tick return and the next tick start.
        let deadline = Instant::now() + interval;
        loop {
            if *cancelled {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _timeout) = match state.wakeup.wait_timeout(cancelled, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            cancelled = guard;
        }

        drop(cancelled);
        tick();
        cancelled = lock_cancelled(state);
    }
}

fn lock_cancelled(state: &ScheduleState) -> std::sync::MutexGuard<'_, bool> {
    match state.cancelled.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ScheduleHandle for ThreadScheduleHandle {
    fn cancel(&self) {
        {
            let mut cancelled = lock_cancelled(&self.state);
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.state.wakeup.notify_all();

        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            warn!(
                target: "searchbrake.scheduler",
                "tick worker panicked during shutdown"
            );
        }
    }
}

impl Drop for ThreadScheduleHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
