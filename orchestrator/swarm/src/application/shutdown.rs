// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shutdown Coordinator
//!
//! Cooperative stop handshake for live workers:
//!
//! 1. send `{type: "shutdown", payload: {gracePeriodMs, reason}}` and arm a grace timer
//! 2. `shutdown_ack` before the deadline cancels the timer; the worker exits on its own
//! 3. otherwise the timer delivers SIGKILL
//!
//! Whichever way the process ends, its exit is terminal: the record becomes
//! `terminated` with crash accounting reset, and a pending restart respawns it.

use std::time::Duration;
use tracing::{debug, info, warn};

use aegis_swarm_core::events::SwarmEvent;
use aegis_swarm_core::ipc::{IpcMessage, ShutdownReason};
use aegis_swarm_core::process::{ProcessKey, ProcessStatus};
use aegis_swarm_core::spawner::Signal;

use super::orchestrator::Inner;
use super::state::{ArmedTimer, Draining, SwarmState};

impl Inner {
    /// Start the shutdown handshake for `key`.
    ///
    /// Returns `true` if a live process was asked to stop (or already is
    /// stopping). A record without a live process is marked terminated.
    pub(crate) fn begin_shutdown(
        &self,
        state: &mut SwarmState,
        key: &ProcessKey,
        grace_period: Option<Duration>,
        reason: ShutdownReason,
    ) -> bool {
        let token = state.next_token();
        let Some(record) = state.records.get_mut(key) else {
            return false;
        };

        let Some(handle) = record.handle.as_ref() else {
            if let Some(timer) = record.backoff_timer.take() {
                self.timer.clear_timeout(timer.id);
            }
            record.status = ProcessStatus::Terminated;
            record.reset_crash_tracking();
            return false;
        };

        if record.draining.is_some() {
            debug!(process = %key, "Shutdown already in progress");
            return true;
        }

        let grace_period = grace_period.unwrap_or_else(|| self.config.default_grace_period());
        let grace_period_ms = u64::try_from(grace_period.as_millis()).unwrap_or(u64::MAX);

        let request = IpcMessage::shutdown(key.name(), grace_period_ms, reason);
        if let Err(error) = handle.send(&request) {
            debug!(
                process = %key,
                error = %error,
                "Shutdown request not delivered, relying on grace timer"
            );
        }

        let weak = self.weak.clone();
        let timer_key = key.clone();
        let id = self.timer.set_timeout(
            grace_period,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_grace_expired(&timer_key, token);
                }
            }),
        );

        record.draining = Some(Draining {
            grace_timer: Some(ArmedTimer { id, token }),
            grace_period_ms,
            reason,
            acknowledged: false,
        });

        info!(
            swarm_name = %self.config.swarm_name,
            process = %key,
            grace_period_ms,
            reason = reason.as_str(),
            "Shutdown requested"
        );
        self.events.publish(SwarmEvent::ProcessTerminated {
            key: key.clone(),
            reason: reason.as_str().to_string(),
            terminated_at: self.clock.now(),
        });
        true
    }

    fn on_grace_expired(&self, key: &ProcessKey, token: u64) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(key) else {
            return;
        };
        let Some(draining) = record.draining.as_mut() else {
            return;
        };
        if draining.grace_timer.map(|t| t.token) != Some(token) {
            return;
        }
        // The exit notification finishes the record.
        draining.grace_timer = None;
        let Some(handle) = record.handle.as_ref() else {
            return;
        };

        handle.kill(Signal::Kill);
        warn!(
            event = "orchestrator.forceKill",
            swarm_name = %self.config.swarm_name,
            process = %key,
            pid = ?record.pid,
            grace_period_ms = draining.grace_period_ms,
            reason = draining.reason.as_str(),
            "Worker did not acknowledge shutdown within grace period, sent SIGKILL"
        );
        metrics::counter!("aegis_swarm_forced_kills_total").increment(1);
        self.events.publish(SwarmEvent::ProcessForceKilled {
            key: key.clone(),
            grace_period_ms: draining.grace_period_ms,
            shutdown_reason: draining.reason,
            killed_at: self.clock.now(),
        });
    }

    /// Complete the handshake for the worker that sent `message`.
    ///
    /// `origin` is the sending process when known; otherwise the worker is
    /// looked up by `from` and the payload's `instanceKey`.
    pub(crate) fn handle_shutdown_ack(
        &self,
        state: &mut SwarmState,
        message: &IpcMessage,
        origin: Option<(&ProcessKey, u64)>,
    ) {
        let Some(key) = ack_target(state, message, origin) else {
            debug!(from = %message.from, "shutdown_ack from unknown worker ignored");
            return;
        };
        let Some(draining) = state.records.get_mut(&key).and_then(|r| r.draining.as_mut()) else {
            debug!(process = %key, "Unsolicited shutdown_ack ignored");
            return;
        };
        if draining.acknowledged {
            return;
        }
        draining.acknowledged = true;
        if let Some(timer) = draining.grace_timer.take() {
            self.timer.clear_timeout(timer.id);
        }
        info!(
            swarm_name = %self.config.swarm_name,
            process = %key,
            "Shutdown acknowledged"
        );
    }

    /// Stop everything: no more reconciling, no more scheduled respawns or
    /// request timeouts, and a shutdown handshake for every live process.
    pub(crate) fn shutdown_all(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;

        if let Some(id) = state.reconcile_interval.take() {
            self.timer.clear_interval(id);
        }
        for (_, pending) in state.correlations.drain() {
            if let Some(timer) = pending.timeout {
                self.timer.clear_timeout(timer.id);
            }
        }

        let keys: Vec<ProcessKey> = state.records.keys().cloned().collect();
        let mut draining = 0usize;
        for key in &keys {
            if let Some(record) = state.records.get_mut(key) {
                if let Some(timer) = record.backoff_timer.take() {
                    self.timer.clear_timeout(timer.id);
                }
                record.restart_after_exit = false;
            }
            if self.begin_shutdown(state, key, None, ShutdownReason::OrchestratorShutdown) {
                draining += 1;
            }
        }

        info!(
            swarm_name = %self.config.swarm_name,
            draining,
            "Orchestrator shutting down"
        );
        self.refresh_live(state);
    }
}

fn ack_target(
    state: &SwarmState,
    message: &IpcMessage,
    origin: Option<(&ProcessKey, u64)>,
) -> Option<ProcessKey> {
    if let Some((key, generation)) = origin {
        let current = state.records.get(key).map(|r| r.generation);
        return (current == Some(generation)).then(|| key.clone());
    }

    if let Some(instance_key) = message.shutdown_ack_payload().instance_key {
        let key = ProcessKey::agent(message.from.clone(), instance_key);
        if state.records.contains_key(&key) {
            return Some(key);
        }
    }
    let connector = ProcessKey::connector(message.from.clone());
    if state.records.contains_key(&connector) {
        return Some(connector);
    }

    let mut draining = state.records.values().filter(|r| {
        r.draining.is_some()
            && matches!(&r.key, ProcessKey::Agent { name, .. } if *name == message.from)
    });
    match (draining.next(), draining.next()) {
        (Some(record), None) => Some(record.key.clone()),
        _ => None,
    }
}
