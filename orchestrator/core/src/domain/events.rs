// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ipc::ShutdownReason;
use crate::domain::process::{ProcessKey, ProcessStatus};

/// Lifecycle and routing events emitted by the swarm supervisor.
///
/// Published on the in-memory event bus for observers (CLI streaming,
/// dashboards, tests). Never required for correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SwarmEvent {
    ProcessSpawned {
        key: ProcessKey,
        pid: Option<u32>,
        generation: u64,
        spawned_at: DateTime<Utc>,
    },
    SpawnFailed {
        key: ProcessKey,
        error: String,
        consecutive_crashes: u32,
        failed_at: DateTime<Utc>,
    },
    ProcessExited {
        key: ProcessKey,
        exit_code: Option<i32>,
        status: ProcessStatus,
        consecutive_crashes: u32,
        exited_at: DateTime<Utc>,
    },
    CrashLoopBackOff {
        key: ProcessKey,
        consecutive_crashes: u32,
        backoff_ms: u64,
        next_spawn_allowed_at: DateTime<Utc>,
        entered_at: DateTime<Utc>,
    },
    /// A record was removed or a process was asked to stop.
    ProcessTerminated {
        key: ProcessKey,
        reason: String,
        terminated_at: DateTime<Utc>,
    },
    ProcessForceKilled {
        key: ProcessKey,
        grace_period_ms: u64,
        shutdown_reason: ShutdownReason,
        killed_at: DateTime<Utc>,
    },
    RoutingRejected {
        from: String,
        target: String,
        correlation_id: Option<String>,
        error_code: String,
        rejected_at: DateTime<Utc>,
    },
    RequestTimedOut {
        correlation_id: String,
        requester: ProcessKey,
        target: String,
        timed_out_at: DateTime<Utc>,
    },
}

impl SwarmEvent {
    /// Process identity the event is about, when there is one.
    pub fn process_key(&self) -> Option<&ProcessKey> {
        match self {
            Self::ProcessSpawned { key, .. }
            | Self::SpawnFailed { key, .. }
            | Self::ProcessExited { key, .. }
            | Self::CrashLoopBackOff { key, .. }
            | Self::ProcessTerminated { key, .. }
            | Self::ProcessForceKilled { key, .. } => Some(key),
            Self::RequestTimedOut { requester, .. } => Some(requester),
            Self::RoutingRejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_loop_event_serialization() {
        let now = Utc::now();
        let event = SwarmEvent::CrashLoopBackOff {
            key: ProcessKey::default_agent("coder"),
            consecutive_crashes: 2,
            backoff_ms: 1000,
            next_spawn_allowed_at: now,
            entered_at: now,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CrashLoopBackOff");
        assert_eq!(json["key"]["kind"], "agent");
        assert_eq!(json["key"]["instance_key"], "default");

        let back: SwarmEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_process_key_accessor() {
        let event = SwarmEvent::RoutingRejected {
            from: "alpha".to_string(),
            target: "alpha".to_string(),
            correlation_id: Some("corr-1".to_string()),
            error_code: "CIRCULAR_CALL_DETECTED".to_string(),
            rejected_at: Utc::now(),
        };
        assert!(event.process_key().is_none());

        let event = SwarmEvent::ProcessTerminated {
            key: ProcessKey::connector("telegram"),
            reason: "connector_not_in_desired_state".to_string(),
            terminated_at: Utc::now(),
        };
        assert_eq!(event.process_key(), Some(&ProcessKey::connector("telegram")));
    }
}
