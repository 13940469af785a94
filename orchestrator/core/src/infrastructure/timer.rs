// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Clock & Timer Implementations
//!
//! | Type | Use |
//! |------|-----|
//! | [`SystemClock`] | Wall clock (`Utc::now`) |
//! | [`TokioTimer`] | Timeouts and intervals backed by tasks on a tokio runtime |
//! | [`ManualClock`] | Clock that only moves when told to |
//! | [`ManualTimer`] | Deterministic timer driven by [`ManualTimer::advance`] |

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::backoff::after;
use crate::domain::clock::{
    Clock, IntervalCallback, TimeoutCallback, Timer, TimerError, TimerId,
};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Timer whose callbacks run as tasks on a tokio runtime.
///
/// Outstanding timers are aborted when the timer is dropped.
pub struct TokioTimer {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Timer bound to the runtime of the calling context.
    pub fn try_current() -> Result<Self, TimerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| TimerError::NoRuntime)
    }

    /// Number of timers still scheduled.
    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }

    fn cancel(&self, id: TimerId) {
        if let Some(task) = self.tasks.lock().remove(&id.0) {
            task.abort();
        }
    }
}

impl Timer for TokioTimer {
    fn set_timeout(&self, delay: Duration, callback: TimeoutCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();

        // Registration completes before the task can observe the map.
        let mut guard = self.tasks.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_armed = tasks.lock().remove(&id).is_some();
            if still_armed {
                callback();
            }
        });
        guard.insert(id, task.abort_handle());
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        self.cancel(id);
    }

    fn set_interval(&self, period: Duration, callback: IntervalCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let period = period.max(MIN_INTERVAL);

        let mut guard = self.tasks.lock();
        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });
        guard.insert(id, task.abort_handle());
        TimerId(id)
    }

    fn clear_interval(&self, id: TimerId) {
        self.cancel(id);
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

/// Clock for tests. Time moves only through [`ManualClock::advance`] or
/// [`ManualClock::set`].
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = after(*now, duration_ms(by));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

enum ManualEntry {
    Once(TimeoutCallback),
    Every(Duration, IntervalCallback),
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    // (due, id) keeps firing order deterministic for equal deadlines.
    queue: BTreeMap<(DateTime<Utc>, u64), ManualEntry>,
    due_by_id: HashMap<u64, DateTime<Utc>>,
}

impl ManualState {
    fn insert(&mut self, id: u64, due: DateTime<Utc>, entry: ManualEntry) {
        self.queue.insert((due, id), entry);
        self.due_by_id.insert(id, due);
    }

    fn remove(&mut self, id: u64) {
        if let Some(due) = self.due_by_id.remove(&id) {
            self.queue.remove(&(due, id));
        }
    }
}

/// Deterministic timer driven by an explicit [`advance`](ManualTimer::advance).
///
/// Callbacks fire in deadline order with the shared [`ManualClock`] set to
/// each deadline, and run without the timer lock held.
pub struct ManualTimer {
    clock: Arc<ManualClock>,
    state: Mutex<ManualState>,
}

impl ManualTimer {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ManualState::default()),
        }
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    /// Move time forward by `by`, firing every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = after(self.clock.now(), duration_ms(by));
        loop {
            let next = {
                let mut state = self.state.lock();
                let first = state
                    .queue
                    .keys()
                    .next()
                    .copied()
                    .filter(|(due, _)| *due <= target);
                match first {
                    None => None,
                    Some((due, id)) => {
                        state.due_by_id.remove(&id);
                        let entry = state.queue.remove(&(due, id));
                        if let Some(ManualEntry::Every(period, callback)) = &entry {
                            let next_due = after(due, duration_ms(*period));
                            state.insert(id, next_due, ManualEntry::Every(*period, callback.clone()));
                        }
                        entry.map(|entry| (due, entry))
                    }
                }
            };

            match next {
                None => break,
                Some((due, entry)) => {
                    if due > self.clock.now() {
                        self.clock.set(due);
                    }
                    match entry {
                        ManualEntry::Once(callback) => callback(),
                        ManualEntry::Every(_, callback) => callback(),
                    }
                }
            }
        }
        if target > self.clock.now() {
            self.clock.set(target);
        }
    }

    /// Fire timers already due without moving time.
    pub fn run_due(&self) {
        self.advance(Duration::ZERO);
    }

    /// Number of scheduled timeouts and intervals.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn schedule(&self, delay: Duration, entry: ManualEntry) -> TimerId {
        let due = after(self.clock.now(), duration_ms(delay));
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.insert(id, due, entry);
        TimerId(id)
    }
}

impl Timer for ManualTimer {
    fn set_timeout(&self, delay: Duration, callback: TimeoutCallback) -> TimerId {
        self.schedule(delay, ManualEntry::Once(callback))
    }

    fn clear_timeout(&self, id: TimerId) {
        self.state.lock().remove(id.0);
    }

    fn set_interval(&self, period: Duration, callback: IntervalCallback) -> TimerId {
        let period = period.max(MIN_INTERVAL);
        self.schedule(period, ManualEntry::Every(period, callback))
    }

    fn clear_interval(&self, id: TimerId) {
        self.state.lock().remove(id.0);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
