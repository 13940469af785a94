// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Reconciler
//!
//! Converges the running set of workers towards the desired state. Each
//! pass both plans and executes, and reports what it did:
//!
//! | Bucket | Meaning |
//! |--------|---------|
//! | `to_spawn` | processes started during this pass |
//! | `to_respawn` | crash-looping records whose delayed respawn was scheduled during this pass |
//! | `to_terminate` | records removed because they left the desired state |
//!
//! A pass with no intervening state change reports nothing. Scheduled
//! respawns are carried out by a per-record backoff timer, or by the first
//! pass that runs after `next_spawn_allowed_at`, whichever comes first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use aegis_swarm_core::events::SwarmEvent;
use aegis_swarm_core::process::{ProcessKey, ProcessStatus};
use aegis_swarm_core::spawner::Signal;

use super::orchestrator::Inner;
use super::state::{ArmedTimer, SwarmState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnTarget {
    pub key: ProcessKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RespawnTarget {
    pub key: ProcessKey,
    /// Backoff delay applied by the crash that gated this record.
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    NotInDesiredState,
    ConnectorNotInDesiredState,
}

impl TerminationReason {
    pub fn for_key(key: &ProcessKey) -> Self {
        match key {
            ProcessKey::Agent { .. } => Self::NotInDesiredState,
            ProcessKey::Connector { .. } => Self::ConnectorNotInDesiredState,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInDesiredState => "not_in_desired_state",
            Self::ConnectorNotInDesiredState => "connector_not_in_desired_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminateTarget {
    pub key: ProcessKey,
    pub reason: TerminationReason,
}

impl TerminateTarget {
    pub fn name(&self) -> &str {
        self.key.name()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub to_spawn: Vec<SpawnTarget>,
    pub to_respawn: Vec<RespawnTarget>,
    pub to_terminate: Vec<TerminateTarget>,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.to_spawn.is_empty() && self.to_respawn.is_empty() && self.to_terminate.is_empty()
    }
}

impl Inner {
    pub(crate) fn reconcile(&self) -> ReconciliationResult {
        let _pass = self.reconcile_lock.lock();
        self.reconcile_pass()
    }

    /// Interval entry point: skips when a pass is already running.
    pub(crate) fn reconcile_tick(&self) {
        match self.reconcile_lock.try_lock() {
            Some(_pass) => {
                let result = self.reconcile_pass();
                if !result.is_empty() {
                    debug!(
                        swarm_name = %self.config.swarm_name,
                        spawned = result.to_spawn.len(),
                        respawns_scheduled = result.to_respawn.len(),
                        terminated = result.to_terminate.len(),
                        "Periodic reconcile applied changes"
                    );
                }
            }
            None => debug!(
                swarm_name = %self.config.swarm_name,
                "Reconcile already in progress, skipping tick"
            ),
        }
    }

    fn reconcile_pass(&self) -> ReconciliationResult {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut result = ReconciliationResult::default();
        if state.shutting_down {
            return result;
        }

        let now = self.clock.now();
        self.retire_unwanted(state, now, &mut result);

        let mut attempted = HashSet::new();
        for key in state.desired.keys() {
            match state.records.get_mut(&key) {
                Some(record) => record.on_demand = false,
                None => {
                    self.spawn_process(state, &key);
                    attempted.insert(key.clone());
                    result.to_spawn.push(SpawnTarget { key });
                }
            }
        }

        let managed: Vec<ProcessKey> = state.records.keys().cloned().collect();
        for key in managed {
            let Some(record) = state.records.get(&key) else {
                continue;
            };
            if record.is_live() || record.on_demand || attempted.contains(&key) {
                continue;
            }
            let spawn_now = match record.status {
                ProcessStatus::Running => false,
                ProcessStatus::Pending | ProcessStatus::Terminated => true,
                ProcessStatus::CrashLoopBackOff => !record.is_gated(now),
            };
            if spawn_now {
                self.spawn_process(state, &key);
                result.to_spawn.push(SpawnTarget { key });
                continue;
            }
            if record.status == ProcessStatus::CrashLoopBackOff && record.backoff_timer.is_none() {
                let backoff_ms = record.backoff_ms;
                let remaining = record
                    .next_spawn_allowed_at
                    .and_then(|at| (at - now).to_std().ok())
                    .unwrap_or_default();
                self.arm_backoff_timer(state, &key, remaining);
                result.to_respawn.push(RespawnTarget { key, backoff_ms });
            }
        }

        if !result.is_empty() {
            info!(
                swarm_name = %self.config.swarm_name,
                to_spawn = result.to_spawn.len(),
                to_respawn = result.to_respawn.len(),
                to_terminate = result.to_terminate.len(),
                "Reconcile pass complete"
            );
        }
        result
    }

    /// Drop every record that is no longer wanted, sending SIGTERM to its
    /// process if one is live.
    ///
    /// Declared identities are always wanted. Other on-demand records are
    /// wanted while their agent name is desired and they are live or still
    /// gated by backoff.
    fn retire_unwanted(
        &self,
        state: &mut SwarmState,
        now: DateTime<Utc>,
        result: &mut ReconciliationResult,
    ) {
        let unmanaged: Vec<ProcessKey> = state
            .records
            .iter()
            .filter(|(key, record)| {
                if state.desired.declares(key) {
                    false
                } else if record.on_demand {
                    !state.desired.manages(key) || (!record.is_live() && !record.is_gated(now))
                } else {
                    true
                }
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in unmanaged {
            let Some(mut record) = state.records.remove(&key) else {
                continue;
            };
            self.cancel_record_timers(&mut record);
            let reason = TerminationReason::for_key(&key);

            match record.handle.take() {
                Some(handle) => {
                    handle.kill(Signal::Term);
                    info!(
                        swarm_name = %self.config.swarm_name,
                        process = %key,
                        pid = ?record.pid,
                        reason = reason.as_str(),
                        "Terminating worker no longer in desired state"
                    );
                    self.events.publish(SwarmEvent::ProcessTerminated {
                        key: key.clone(),
                        reason: reason.as_str().to_string(),
                        terminated_at: self.clock.now(),
                    });
                    result.to_terminate.push(TerminateTarget { key, reason });
                }
                None => debug!(
                    swarm_name = %self.config.swarm_name,
                    process = %key,
                    status = %record.status,
                    "Forgetting stopped worker no longer in desired state"
                ),
            }
        }
        self.refresh_live(state);
    }

    fn arm_backoff_timer(&self, state: &mut SwarmState, key: &ProcessKey, delay: Duration) {
        let token = state.next_token();
        let weak = self.weak.clone();
        let timer_key = key.clone();
        let id = self.timer.set_timeout(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_backoff_elapsed(&timer_key, token);
                }
            }),
        );
        if let Some(record) = state.records.get_mut(key) {
            record.backoff_timer = Some(ArmedTimer { id, token });
        }
        debug!(
            swarm_name = %self.config.swarm_name,
            process = %key,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Backoff respawn scheduled"
        );
    }

    /// Backoff timer callback. Acts only if the record is still the one the
    /// timer was armed for and is still wanted.
    fn on_backoff_elapsed(&self, key: &ProcessKey, token: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return;
        }
        let declared = state.desired.declares(key);
        let Some(record) = state.records.get_mut(key) else {
            debug!(process = %key, "Backoff timer fired for removed record");
            return;
        };
        if record.backoff_timer.map(|t| t.token) != Some(token) {
            return;
        }
        record.backoff_timer = None;
        let still_wanted = declared && !record.on_demand;
        if record.status != ProcessStatus::CrashLoopBackOff || record.is_live() || !still_wanted {
            debug!(process = %key, status = %record.status, "Backoff timer no longer applicable");
            return;
        }

        let now = self.clock.now();
        if let Some(at) = record.next_spawn_allowed_at.filter(|at| *at > now) {
            let remaining = (at - now).to_std().unwrap_or_default();
            self.arm_backoff_timer(state, key, remaining);
            return;
        }
        self.spawn_process(state, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reason_wire_names() {
        assert_eq!(
            TerminationReason::for_key(&ProcessKey::connector("telegram")).as_str(),
            "connector_not_in_desired_state"
        );
        assert_eq!(
            serde_json::to_value(TerminationReason::NotInDesiredState).unwrap(),
            "not_in_desired_state"
        );
    }

    #[test]
    fn test_empty_result() {
        let mut result = ReconciliationResult::default();
        assert!(result.is_empty());
        result.to_respawn.push(RespawnTarget {
            key: ProcessKey::default_agent("coder"),
            backoff_ms: 1000,
        });
        assert!(!result.is_empty());
    }
}
