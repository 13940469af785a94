// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Orchestrator
//!
//! [`Orchestrator`] owns the full supervision state of one swarm and is the
//! only entry point for callers. The work is split across sibling modules,
//! all operating on the same locked [`SwarmState`]:
//!
//! | Concern | Module | Entry points |
//! |---------|--------|--------------|
//! | Desired vs. actual convergence | [`reconciler`](super::reconciler) | [`Orchestrator::reconcile`], [`Orchestrator::start`] |
//! | Inter-agent messaging | [`router`](super::router) | [`Orchestrator::route`] |
//! | Graceful stop with forced fallback | [`shutdown`](super::shutdown) | [`Orchestrator::terminate`], [`Orchestrator::shutdown`] |
//! | Spawning and crash accounting | this module | [`Orchestrator::spawn`] |
//!
//! Process notifications (inbound messages and exits) arrive through the
//! [`ProcessEventSink`] implementation and are applied immediately, whether
//! or not a reconcile pass is running.
//!
//! Instances share nothing: every collaborator is injected, so several
//! orchestrators can run side by side in one process.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use aegis_swarm_core::backoff::{CrashBackoffPolicy, ExitKind};
use aegis_swarm_core::clock::{Clock, Timer};
use aegis_swarm_core::desired_state::DesiredState;
use aegis_swarm_core::events::SwarmEvent;
use aegis_swarm_core::infrastructure::event_bus::{EventBus, EventReceiver};
use aegis_swarm_core::ipc::{IpcMessage, ShutdownReason, DEFAULT_INSTANCE_KEY};
use aegis_swarm_core::process::{ProcessKey, ProcessSnapshot, ProcessStatus};
use aegis_swarm_core::spawner::{
    HandleError, ProcessChannel, ProcessEventSink, ProcessSpawner, Signal, WorkerSpec,
};
use aegis_swarm_core::swarm_config::{SwarmConfig, SwarmConfigError};

use super::reconciler::ReconciliationResult;
use super::state::{Record, SwarmState};

pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: SwarmConfig,
    pub(crate) policy: CrashBackoffPolicy,
    worker_spec: WorkerSpec,
    spawner: Arc<dyn ProcessSpawner>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) events: EventBus,
    pub(crate) state: Mutex<SwarmState>,
    /// Serializes reconcile passes.
    pub(crate) reconcile_lock: Mutex<()>,
    live: watch::Sender<usize>,
    pub(crate) weak: Weak<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator from validated configuration.
    ///
    /// Nothing is spawned until [`reconcile`](Self::reconcile),
    /// [`start`](Self::start) or [`spawn`](Self::spawn) is called.
    pub fn new(
        config: SwarmConfig,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn Timer>,
        events: EventBus,
    ) -> Result<Self, SwarmConfigError> {
        config.validate()?;

        let policy = config.backoff_policy();
        let worker_spec = config.worker_spec();
        let desired = config.desired_state();
        let (live, _) = watch::channel(0usize);

        let inner = Arc::new_cyclic(|weak| Inner {
            config,
            policy,
            worker_spec,
            spawner,
            clock,
            timer,
            events,
            state: Mutex::new(SwarmState::new(desired)),
            reconcile_lock: Mutex::new(()),
            live,
            weak: weak.clone(),
        });

        info!(
            swarm_name = %inner.config.swarm_name,
            crash_threshold = inner.policy.crash_threshold,
            initial_backoff_ms = inner.policy.initial_backoff_ms,
            max_backoff_ms = inner.policy.max_backoff_ms,
            "Swarm orchestrator created"
        );

        Ok(Self { inner })
    }

    pub fn swarm_name(&self) -> &str {
        &self.inner.config.swarm_name
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    /// Start the periodic reconcile loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.reconcile_interval.is_some() || state.shutting_down {
            return;
        }
        let weak = self.inner.weak.clone();
        let id = self.inner.timer.set_interval(
            self.inner.config.reconcile_interval(),
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.reconcile_tick();
                }
            }),
        );
        state.reconcile_interval = Some(id);
        info!(
            swarm_name = %self.inner.config.swarm_name,
            interval_ms = self.inner.config.reconcile_interval_ms,
            "Reconcile loop started"
        );
    }

    /// Stop the periodic reconcile loop.
    pub fn stop(&self) {
        let interval = self.inner.state.lock().reconcile_interval.take();
        if let Some(id) = interval {
            self.inner.timer.clear_interval(id);
            info!(swarm_name = %self.inner.config.swarm_name, "Reconcile loop stopped");
        }
    }

    /// Run one reconcile pass, waiting for any pass already in progress.
    pub fn reconcile(&self) -> ReconciliationResult {
        self.inner.reconcile()
    }

    /// Make sure an agent instance is running, ignoring desired state and
    /// crash-loop gating. Returns a live view of its record.
    ///
    /// Once [`shutdown`](Self::shutdown) has been called nothing is started.
    pub fn spawn(&self, agent_name: &str, instance_key: &str) -> AgentHandle {
        let key = ProcessKey::agent(agent_name, instance_key);
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                warn!(
                    swarm_name = %self.inner.config.swarm_name,
                    process = %key,
                    "Spawn requested during shutdown, ignoring"
                );
            } else {
                self.inner.spawn_process(&mut state, &key);
            }
        }
        AgentHandle {
            inner: self.inner.weak.clone(),
            key,
        }
    }

    /// Handle for an existing agent record without spawning anything.
    pub fn agent(&self, agent_name: &str, instance_key: &str) -> Option<AgentHandle> {
        let key = ProcessKey::agent(agent_name, instance_key);
        self.inner
            .state
            .lock()
            .records
            .contains_key(&key)
            .then(|| AgentHandle {
                inner: self.inner.weak.clone(),
                key,
            })
    }

    /// Route one inbound IPC message as if a worker had sent it.
    pub fn route(&self, message: IpcMessage) {
        self.inner.route(message, None);
    }

    /// Ask a process to stop, force-killing it after the grace period.
    ///
    /// Returns `false` when there is no live process for `key`.
    pub fn terminate(&self, key: &ProcessKey, grace_period: Option<Duration>) -> bool {
        let mut state = self.inner.state.lock();
        self.inner
            .begin_shutdown(&mut state, key, grace_period, ShutdownReason::Operator)
    }

    /// Replace the desired state. Takes effect on the next reconcile pass.
    pub fn set_desired_state(&self, desired: DesiredState) {
        let mut state = self.inner.state.lock();
        info!(
            swarm_name = %self.inner.config.swarm_name,
            agents = desired.agents.len(),
            connectors = desired.connectors.len(),
            "Desired state replaced"
        );
        state.desired = desired;
    }

    pub fn desired_state(&self) -> DesiredState {
        self.inner.state.lock().desired.clone()
    }

    /// Gracefully restart every instance of `agent_name` with fresh crash
    /// accounting. Returns the number of instances affected.
    pub fn restart(&self, agent_name: &str) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.restart_agent(&mut state, agent_name)
    }

    /// Restart every agent that has a record.
    pub fn reload_and_restart_all(&self) -> usize {
        let mut state = self.inner.state.lock();
        let mut names: Vec<String> = state
            .records
            .keys()
            .filter(|key| matches!(key, ProcessKey::Agent { .. }))
            .map(|key| key.name().to_string())
            .collect();
        names.dedup();
        names
            .iter()
            .map(|name| self.inner.restart_agent(&mut state, name))
            .sum()
    }

    /// Stop reconciling, cancel outstanding timers and ask every live
    /// process to shut down.
    pub fn shutdown(&self) {
        self.inner.shutdown_all();
    }

    /// Resolves once no supervised process is live.
    pub async fn wait_until_drained(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|count| *count == 0).await;
    }

    pub fn live_processes(&self) -> usize {
        *self.inner.live.borrow()
    }

    pub fn records(&self) -> Vec<ProcessSnapshot> {
        self.inner
            .state
            .lock()
            .records
            .values()
            .map(Record::snapshot)
            .collect()
    }

    pub fn record(&self, key: &ProcessKey) -> Option<ProcessSnapshot> {
        self.inner.state.lock().records.get(key).map(Record::snapshot)
    }

    /// Requests forwarded and still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().correlations.len()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(id) = state.reconcile_interval.take() {
            self.inner.timer.clear_interval(id);
        }
        for (_, pending) in state.correlations.drain() {
            if let Some(timer) = pending.timeout {
                self.inner.timer.clear_timeout(timer.id);
            }
        }
        for record in state.records.values_mut() {
            self.inner.cancel_record_timers(record);
            if let Some(handle) = record.handle.take() {
                debug!(process = %record.key, "Killing worker on orchestrator drop");
                handle.kill(Signal::Kill);
            }
        }
    }
}

impl Inner {
    pub(crate) fn sink(&self) -> Weak<dyn ProcessEventSink> {
        self.weak.clone()
    }

    pub(crate) fn refresh_live(&self, state: &SwarmState) {
        self.live.send_replace(state.live_count());
    }

    /// Start a process for `key` unless one is already live, creating the
    /// record on first use. Returns whether a process is live afterwards.
    pub(crate) fn spawn_process(&self, state: &mut SwarmState, key: &ProcessKey) -> bool {
        let declared = state.desired.declares(key);
        let live = {
            let record = state
                .records
                .entry(key.clone())
                .or_insert_with(|| Record::new(key.clone(), !declared));
            if declared {
                record.on_demand = false;
            }
            if record.is_live() {
                return true;
            }
            if let Some(timer) = record.backoff_timer.take() {
                self.timer.clear_timeout(timer.id);
            }

            record.generation += 1;
            let channel = ProcessChannel::from_weak(self.sink(), key.clone(), record.generation);
            let spawned = match key {
                ProcessKey::Agent { name, instance_key } => {
                    self.spawner
                        .spawn_agent(name, instance_key, &self.worker_spec, channel)
                }
                ProcessKey::Connector { name } => {
                    self.spawner.spawn_connector(name, &self.worker_spec, channel)
                }
            };

            match spawned {
                Ok(handle) => {
                    record.pid = handle.pid();
                    record.handle = Some(handle);
                    record.status = ProcessStatus::Running;
                    record.next_spawn_allowed_at = None;
                    record.draining = None;
                    record.restart_after_exit = false;

                    info!(
                        swarm_name = %self.config.swarm_name,
                        process = %key,
                        pid = ?record.pid,
                        generation = record.generation,
                        "Worker process spawned"
                    );
                    metrics::counter!(
                        "aegis_swarm_process_spawns_total",
                        "kind" => key.kind().as_str()
                    )
                    .increment(1);
                    self.events.publish(SwarmEvent::ProcessSpawned {
                        key: key.clone(),
                        pid: record.pid,
                        generation: record.generation,
                        spawned_at: self.clock.now(),
                    });
                    true
                }
                Err(error) => {
                    warn!(
                        swarm_name = %self.config.swarm_name,
                        process = %key,
                        error = %error,
                        "Failed to spawn worker process"
                    );
                    self.record_exit(record, ExitKind::SpawnFailure, None);
                    self.events.publish(SwarmEvent::SpawnFailed {
                        key: key.clone(),
                        error: error.to_string(),
                        consecutive_crashes: record.consecutive_crashes,
                        failed_at: self.clock.now(),
                    });
                    false
                }
            }
        };
        self.refresh_live(state);
        live
    }

    /// Apply the backoff policy to a record whose process just ended.
    fn record_exit(&self, record: &mut Record, exit: ExitKind, code: Option<i32>) {
        let now = self.clock.now();
        let outcome = self.policy.evaluate(exit, record.consecutive_crashes, now);

        record.status = outcome.status;
        record.consecutive_crashes = outcome.consecutive_crashes;
        record.next_spawn_allowed_at = outcome.next_spawn_allowed_at;
        if let Some(backoff_ms) = outcome.backoff_ms {
            record.backoff_ms = backoff_ms;
        }

        match exit {
            ExitKind::Clean => {
                if let Some(timer) = record.backoff_timer.take() {
                    self.timer.clear_timeout(timer.id);
                }
                info!(
                    swarm_name = %self.config.swarm_name,
                    process = %record.key,
                    "Worker process exited cleanly"
                );
            }
            ExitKind::Crash | ExitKind::SpawnFailure => {
                warn!(
                    swarm_name = %self.config.swarm_name,
                    process = %record.key,
                    exit_code = ?code,
                    consecutive_crashes = record.consecutive_crashes,
                    "Worker process crashed"
                );
                metrics::counter!(
                    "aegis_swarm_process_crashes_total",
                    "kind" => record.key.kind().as_str()
                )
                .increment(1);
            }
        }

        if exit != ExitKind::SpawnFailure {
            self.events.publish(SwarmEvent::ProcessExited {
                key: record.key.clone(),
                exit_code: code,
                status: record.status,
                consecutive_crashes: record.consecutive_crashes,
                exited_at: now,
            });
        }

        if let (Some(backoff_ms), Some(next)) = (outcome.backoff_ms, outcome.next_spawn_allowed_at) {
            self.report_crash_loop(record, backoff_ms, next, now);
        }
    }

    /// One structured warning per entry into crash-loop backoff.
    fn report_crash_loop(
        &self,
        record: &Record,
        backoff_ms: u64,
        next_spawn_allowed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        match &record.key {
            ProcessKey::Agent { name, instance_key } => warn!(
                event = "orchestrator.crashLoopBackOff",
                swarm_name = %self.config.swarm_name,
                agent_name = %name,
                instance_key = %instance_key,
                status = %record.status,
                consecutive_crashes = record.consecutive_crashes,
                crash_threshold = self.policy.crash_threshold,
                backoff_ms,
                next_spawn_allowed_at = %next_spawn_allowed_at.to_rfc3339(),
                "Agent entered crash loop backoff"
            ),
            ProcessKey::Connector { name } => warn!(
                event = "orchestrator.crashLoopBackOff",
                swarm_name = %self.config.swarm_name,
                connector_name = %name,
                instance_key = DEFAULT_INSTANCE_KEY,
                status = %record.status,
                consecutive_crashes = record.consecutive_crashes,
                crash_threshold = self.policy.crash_threshold,
                backoff_ms,
                next_spawn_allowed_at = %next_spawn_allowed_at.to_rfc3339(),
                "Connector entered crash loop backoff"
            ),
        }
        metrics::counter!(
            "aegis_swarm_crash_loop_backoffs_total",
            "kind" => record.key.kind().as_str()
        )
        .increment(1);
        self.events.publish(SwarmEvent::CrashLoopBackOff {
            key: record.key.clone(),
            consecutive_crashes: record.consecutive_crashes,
            backoff_ms,
            next_spawn_allowed_at,
            entered_at: now,
        });
    }

    fn handle_exit(&self, key: &ProcessKey, generation: u64, code: Option<i32>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let shutting_down = state.shutting_down;

        let Some(record) = state.records.get_mut(key) else {
            debug!(process = %key, exit_code = ?code, "Exit of untracked worker ignored");
            return;
        };
        if record.generation != generation || !record.is_live() {
            debug!(
                process = %key,
                generation,
                current_generation = record.generation,
                "Stale exit notification ignored"
            );
            return;
        }

        record.handle = None;
        record.pid = None;

        let respawn = if let Some(draining) = record.draining.take() {
            if let Some(timer) = draining.grace_timer {
                self.timer.clear_timeout(timer.id);
            }
            record.status = ProcessStatus::Terminated;
            record.reset_crash_tracking();
            info!(
                swarm_name = %self.config.swarm_name,
                process = %key,
                exit_code = ?code,
                reason = draining.reason.as_str(),
                "Worker process stopped after shutdown request"
            );
            self.events.publish(SwarmEvent::ProcessExited {
                key: key.clone(),
                exit_code: code,
                status: record.status,
                consecutive_crashes: 0,
                exited_at: self.clock.now(),
            });
            std::mem::take(&mut record.restart_after_exit) && !shutting_down
        } else if shutting_down {
            record.status = ProcessStatus::Terminated;
            record.reset_crash_tracking();
            false
        } else {
            self.record_exit(record, ExitKind::from_code(code), code);
            false
        };

        if respawn {
            self.spawn_process(state, key);
        }
        self.refresh_live(state);
    }

    pub(crate) fn restart_agent(&self, state: &mut SwarmState, agent_name: &str) -> usize {
        if state.shutting_down {
            return 0;
        }
        let keys: Vec<ProcessKey> = state
            .records
            .keys()
            .filter(|key| matches!(key, ProcessKey::Agent { name, .. } if name == agent_name))
            .cloned()
            .collect();

        for key in &keys {
            let live = match state.records.get_mut(key) {
                Some(record) => {
                    record.reset_crash_tracking();
                    if let Some(timer) = record.backoff_timer.take() {
                        self.timer.clear_timeout(timer.id);
                    }
                    if record.status == ProcessStatus::CrashLoopBackOff {
                        record.status = ProcessStatus::Pending;
                    }
                    record.restart_after_exit = record.is_live();
                    record.is_live()
                }
                None => continue,
            };
            if live {
                self.begin_shutdown(state, key, None, ShutdownReason::Restart);
            } else {
                self.spawn_process(state, key);
            }
        }

        info!(
            swarm_name = %self.config.swarm_name,
            agent_name,
            instances = keys.len(),
            "Agent restart requested"
        );
        keys.len()
    }

    /// Cancel backoff and grace timers owned by a record.
    pub(crate) fn cancel_record_timers(&self, record: &mut Record) {
        if let Some(timer) = record.backoff_timer.take() {
            self.timer.clear_timeout(timer.id);
        }
        if let Some(timer) = record.draining.as_mut().and_then(|d| d.grace_timer.take()) {
            self.timer.clear_timeout(timer.id);
        }
    }
}

impl ProcessEventSink for Inner {
    fn on_message(&self, key: &ProcessKey, generation: u64, message: IpcMessage) {
        self.route(message, Some((key, generation)));
    }

    fn on_exit(&self, key: &ProcessKey, generation: u64, code: Option<i32>) {
        self.handle_exit(key, generation, code);
    }
}

/// Live view of one agent instance's record.
///
/// Reads always reflect the current record; once the record has been
/// removed the handle reports `Terminated` and all operations are no-ops.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Weak<Inner>,
    key: ProcessKey,
}

impl AgentHandle {
    pub fn key(&self) -> &ProcessKey {
        &self.key
    }

    pub fn agent_name(&self) -> &str {
        self.key.name()
    }

    pub fn instance_key(&self) -> &str {
        self.key.instance_key().unwrap_or(DEFAULT_INSTANCE_KEY)
    }

    pub fn snapshot(&self) -> Option<ProcessSnapshot> {
        let inner = self.inner.upgrade()?;
        let state = inner.state.lock();
        state.records.get(&self.key).map(Record::snapshot)
    }

    pub fn status(&self) -> ProcessStatus {
        self.snapshot()
            .map(|s| s.status)
            .unwrap_or(ProcessStatus::Terminated)
    }

    pub fn consecutive_crashes(&self) -> u32 {
        self.snapshot().map(|s| s.consecutive_crashes).unwrap_or(0)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.snapshot().map(|s| s.backoff_ms).unwrap_or(0)
    }

    pub fn next_spawn_allowed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().and_then(|s| s.next_spawn_allowed_at)
    }

    pub fn pid(&self) -> Option<u32> {
        self.snapshot().and_then(|s| s.pid)
    }

    pub fn is_live(&self) -> bool {
        self.snapshot().is_some_and(|s| s.is_live())
    }

    /// Send directly to the live process.
    pub fn send(&self, message: &IpcMessage) -> Result<(), HandleError> {
        let inner = self.inner.upgrade().ok_or(HandleError::Exited)?;
        let state = inner.state.lock();
        match state.records.get(&self.key).and_then(|r| r.handle.as_ref()) {
            Some(handle) => handle.send(message),
            None => Err(HandleError::Exited),
        }
    }

    /// Graceful shutdown with forced-kill fallback.
    pub fn shutdown(&self, grace_period: Option<Duration>) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut state = inner.state.lock();
        inner.begin_shutdown(&mut state, &self.key, grace_period, ShutdownReason::Operator)
    }

    pub fn kill(&self, signal: Signal) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let state = inner.state.lock();
        if let Some(handle) = state.records.get(&self.key).and_then(|r| r.handle.as_ref()) {
            handle.kill(signal);
        }
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle").field("key", &self.key).finish()
    }
}
