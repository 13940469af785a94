// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Supervisor State
//!
//! Everything the orchestrator knows lives in one [`SwarmState`] behind a
//! single lock: per-identity [`Record`]s, the pending request correlations,
//! and the current desired state.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use aegis_swarm_core::clock::TimerId;
use aegis_swarm_core::desired_state::DesiredState;
use aegis_swarm_core::ipc::ShutdownReason;
use aegis_swarm_core::process::{ProcessKey, ProcessSnapshot, ProcessStatus};
use aegis_swarm_core::spawner::ProcessHandle;

/// A scheduled timer plus the token its callback carries.
///
/// Callbacks compare their token with the one stored here before acting, so
/// a timer that fires after being superseded is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArmedTimer {
    pub id: TimerId,
    pub token: u64,
}

/// Shutdown handshake in progress for a live process.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Draining {
    /// Grace timer; `None` once acknowledged or escalated.
    pub grace_timer: Option<ArmedTimer>,
    pub grace_period_ms: u64,
    pub reason: ShutdownReason,
    pub acknowledged: bool,
}

pub(crate) struct Record {
    pub key: ProcessKey,
    pub status: ProcessStatus,
    pub consecutive_crashes: u32,
    pub backoff_ms: u64,
    pub next_spawn_allowed_at: Option<DateTime<Utc>>,
    pub handle: Option<Box<dyn ProcessHandle>>,
    pub pid: Option<u32>,
    /// Incremented on every spawn attempt.
    pub generation: u64,
    pub backoff_timer: Option<ArmedTimer>,
    pub draining: Option<Draining>,
    /// Respawn as soon as the current process exits.
    pub restart_after_exit: bool,
    /// Started by `spawn()` or the router without being declared. Such
    /// records are never respawned and are forgotten once stopped.
    pub on_demand: bool,
}

impl Record {
    pub fn new(key: ProcessKey, on_demand: bool) -> Self {
        Self {
            key,
            status: ProcessStatus::Pending,
            consecutive_crashes: 0,
            backoff_ms: 0,
            next_spawn_allowed_at: None,
            handle: None,
            pid: None,
            generation: 0,
            backoff_timer: None,
            draining: None,
            restart_after_exit: false,
            on_demand,
        }
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    /// Still waiting out a crash-loop backoff at `now`.
    pub fn is_gated(&self, now: DateTime<Utc>) -> bool {
        self.status == ProcessStatus::CrashLoopBackOff
            && self.next_spawn_allowed_at.is_some_and(|at| at > now)
    }

    pub fn reset_crash_tracking(&mut self) {
        self.consecutive_crashes = 0;
        self.next_spawn_allowed_at = None;
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            key: self.key.clone(),
            status: self.status,
            consecutive_crashes: self.consecutive_crashes,
            backoff_ms: self.backoff_ms,
            next_spawn_allowed_at: self.next_spawn_allowed_at,
            pid: self.pid,
            generation: self.generation,
            shutting_down: self.draining.is_some(),
        }
    }
}

/// Outstanding cross-agent request awaiting its response.
#[derive(Debug, Clone)]
pub(crate) struct PendingCorrelation {
    pub requester: ProcessKey,
    pub target: String,
    pub call_chain: Vec<String>,
    pub trace_id: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout: Option<ArmedTimer>,
}

#[derive(Default)]
pub(crate) struct SwarmState {
    pub records: BTreeMap<ProcessKey, Record>,
    pub correlations: HashMap<String, PendingCorrelation>,
    pub desired: DesiredState,
    pub reconcile_interval: Option<TimerId>,
    pub shutting_down: bool,
    next_token: u64,
}

impl SwarmState {
    pub fn new(desired: DesiredState) -> Self {
        Self {
            desired,
            ..Self::default()
        }
    }

    pub fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub fn live_count(&self) -> usize {
        self.records.values().filter(|record| record.is_live()).count()
    }

    /// Key a message addressed to `name` should be delivered to.
    ///
    /// Names of known or desired connectors resolve to the connector; every
    /// other name is an agent instance.
    pub fn address_key(&self, name: &str, instance_key: &str) -> ProcessKey {
        let connector = ProcessKey::connector(name);
        if self.desired.connectors.contains(name) || self.records.contains_key(&connector) {
            connector
        } else {
            ProcessKey::agent(name, instance_key)
        }
    }

    /// Best known instance of the agent `name` for replies.
    ///
    /// Prefers the instance named in the payload, then any existing instance.
    pub fn requester_key(&self, name: &str, instance_key: &str) -> ProcessKey {
        let preferred = self.address_key(name, instance_key);
        if self.records.contains_key(&preferred) {
            return preferred;
        }
        self.records
            .keys()
            .find(|key| matches!(key, ProcessKey::Agent { name: n, .. } if n == name))
            .cloned()
            .unwrap_or(preferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_gating_requires_future_deadline() {
        let now = Utc::now();
        let mut record = Record::new(ProcessKey::default_agent("coder"), false);
        assert!(!record.is_gated(now));

        record.status = ProcessStatus::CrashLoopBackOff;
        record.next_spawn_allowed_at = Some(now + Duration::milliseconds(10));
        assert!(record.is_gated(now));
        assert!(!record.is_gated(now + Duration::milliseconds(10)));
    }

    #[test]
    fn test_address_resolution_prefers_connectors() {
        let mut state = SwarmState::new(DesiredState::from_names(["coder"], ["telegram"]));
        assert_eq!(state.address_key("telegram", "default"), ProcessKey::connector("telegram"));
        assert_eq!(state.address_key("coder", "chat-1"), ProcessKey::agent("coder", "chat-1"));

        let key = ProcessKey::agent("coder", "chat-1");
        state.records.insert(key.clone(), Record::new(key.clone(), true));
        assert_eq!(state.requester_key("coder", "default"), key);
        assert_eq!(
            state.requester_key("reviewer", "default"),
            ProcessKey::default_agent("reviewer")
        );
    }

    #[test]
    fn test_tokens_are_unique() {
        let mut state = SwarmState::default();
        let a = state.next_token();
        let b = state.next_token();
        assert_ne!(a, b);
    }
}
