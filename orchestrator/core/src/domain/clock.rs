// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Clock & Timer Contracts
//!
//! Time is injected so crash timing, backoff and grace periods can be
//! simulated deterministically. Production code uses
//! [`SystemClock`](crate::infrastructure::timer::SystemClock) and
//! [`TokioTimer`](crate::infrastructure::timer::TokioTimer); tests drive
//! [`ManualTimer`](crate::infrastructure::timer::ManualTimer).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Opaque handle for a scheduled timeout or interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;
pub type IntervalCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Timer primitives. Clearing an unknown or already-fired id is a no-op.
///
/// Callbacks run without any timer-internal lock held and may schedule or
/// clear timers themselves.
pub trait Timer: Send + Sync {
    fn set_timeout(&self, delay: Duration, callback: TimeoutCallback) -> TimerId;
    fn clear_timeout(&self, id: TimerId);
    fn set_interval(&self, period: Duration, callback: IntervalCallback) -> TimerId;
    fn clear_interval(&self, id: TimerId);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer requires a running tokio runtime")]
    NoRuntime,
}
