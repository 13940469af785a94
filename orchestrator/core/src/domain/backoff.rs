// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Crash Backoff Policy
//!
//! Pure decision function mapping a worker's crash history to its next
//! status and, when throttled, the delay before the next spawn.
//!
//! ## Decision Table
//! | Exit | Consecutive crashes | Outcome |
//! |------|---------------------|---------|
//! | code 0 | any | `Terminated`, crashes reset to 0 |
//! | non-zero / spawn failure | ≤ threshold | `Pending`, respawn immediately |
//! | non-zero / spawn failure | > threshold | `CrashLoopBackOff`, delay = min(max, initial × 2^(n − threshold − 1)) |

use chrono::{DateTime, Duration, Utc};

use crate::domain::process::ProcessStatus;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Clean,
    /// Non-zero code or killed by a signal.
    Crash,
    /// The OS refused to start the process. Accounted as a crash.
    SpawnFailure,
}

impl ExitKind {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::Clean,
            _ => Self::Crash,
        }
    }
}

/// Result of evaluating an exit against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashOutcome {
    pub status: ProcessStatus,
    pub consecutive_crashes: u32,
    /// Delay applied by this decision, present only when throttled.
    pub backoff_ms: Option<u64>,
    pub next_spawn_allowed_at: Option<DateTime<Utc>>,
}

impl CrashOutcome {
    pub fn is_backoff(&self) -> bool {
        self.status == ProcessStatus::CrashLoopBackOff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashBackoffPolicy {
    pub crash_threshold: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl CrashBackoffPolicy {
    pub fn new(crash_threshold: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            crash_threshold,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Evaluate an exit given the crash count observed *before* it.
    pub fn evaluate(
        &self,
        exit: ExitKind,
        previous_crashes: u32,
        now: DateTime<Utc>,
    ) -> CrashOutcome {
        if exit == ExitKind::Clean {
            return CrashOutcome {
                status: ProcessStatus::Terminated,
                consecutive_crashes: 0,
                backoff_ms: None,
                next_spawn_allowed_at: None,
            };
        }

        let consecutive_crashes = previous_crashes.saturating_add(1);
        match self.backoff_for(consecutive_crashes) {
            None => CrashOutcome {
                status: ProcessStatus::Pending,
                consecutive_crashes,
                backoff_ms: None,
                next_spawn_allowed_at: None,
            },
            Some(backoff_ms) => CrashOutcome {
                status: ProcessStatus::CrashLoopBackOff,
                consecutive_crashes,
                backoff_ms: Some(backoff_ms),
                next_spawn_allowed_at: Some(after(now, backoff_ms)),
            },
        }
    }

    /// Backoff delay for a crash count, or `None` while at or under the threshold.
    pub fn backoff_for(&self, consecutive_crashes: u32) -> Option<u64> {
        if consecutive_crashes <= self.crash_threshold {
            return None;
        }
        let exponent = consecutive_crashes - self.crash_threshold - 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Some(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Millisecond count as a chrono duration, clamped to what chrono can represent.
pub fn millis(ms: u64) -> Duration {
    const MAX_MS: i64 = i64::MAX / 1_000_000;
    Duration::milliseconds(i64::try_from(ms).unwrap_or(MAX_MS).min(MAX_MS))
}

/// `now + ms`, saturating at the latest representable instant.
pub fn after(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    now.checked_add_signed(millis(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
