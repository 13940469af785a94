// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use aegis_swarm::Orchestrator;
use aegis_swarm_core::events::SwarmEvent;
use aegis_swarm_core::infrastructure::{EventBus, EventReceiver, ManualClock, ManualTimer};
use aegis_swarm_core::ipc::{EventPayload, IpcMessage, IpcMessageKind};
use aegis_swarm_core::process::ProcessKey;
use aegis_swarm_core::spawner::{
    ExitNotifier, HandleError, MessageNotifier, ProcessChannel, ProcessHandle, ProcessSpawner,
    Signal, SpawnError, WorkerSpec,
};
use aegis_swarm_core::swarm_config::SwarmConfig;

/// One process the fake spawner pretended to start.
pub struct FakeProcess {
    pub key: ProcessKey,
    pub generation: u64,
    pub pid: u32,
    sent: Mutex<Vec<IpcMessage>>,
    kills: Mutex<Vec<Signal>>,
    exit: Mutex<Option<ExitNotifier>>,
    messages: MessageNotifier,
}

impl FakeProcess {
    pub fn sent(&self) -> Vec<IpcMessage> {
        self.sent.lock().clone()
    }

    pub fn kills(&self) -> Vec<Signal> {
        self.kills.lock().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.lock().is_none()
    }

    /// Payloads of the `event` messages this process received.
    pub fn events(&self) -> Vec<EventPayload> {
        self.sent()
            .iter()
            .filter(|m| m.kind == IpcMessageKind::Event)
            .filter_map(IpcMessage::event_payload)
            .collect()
    }

    pub fn shutdown_requests(&self) -> Vec<IpcMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.kind == IpcMessageKind::Shutdown)
            .collect()
    }
}

struct FakeHandle {
    process: Arc<FakeProcess>,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.process.pid)
    }

    fn send(&self, message: &IpcMessage) -> Result<(), HandleError> {
        if self.process.has_exited() {
            return Err(HandleError::Exited);
        }
        self.process.sent.lock().push(message.clone());
        Ok(())
    }

    fn kill(&self, signal: Signal) {
        self.process.kills.lock().push(signal);
    }
}

/// Spawner that records every launch and lets tests drive exits and
/// inbound messages by hand.
#[derive(Default)]
pub struct FakeSpawner {
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    failures: Mutex<u32>,
    next_pid: Mutex<u32>,
}

impl FakeSpawner {
    /// Make the next `count` spawn attempts fail.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    pub fn spawn_count(&self, key: &ProcessKey) -> usize {
        self.processes.lock().iter().filter(|p| &p.key == key).count()
    }

    pub fn total_spawns(&self) -> usize {
        self.processes.lock().len()
    }

    /// Most recent process started for `key`.
    pub fn latest(&self, key: &ProcessKey) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .iter()
            .rev()
            .find(|p| &p.key == key)
            .cloned()
            .unwrap_or_else(|| panic!("{} was never spawned", key))
    }

    /// Report that the latest process for `key` exited with `code`.
    pub fn exit(&self, key: &ProcessKey, code: Option<i32>) {
        let process = self.latest(key);
        let notifier = process.exit.lock().take();
        notifier
            .unwrap_or_else(|| panic!("{} already exited", key))
            .notify(code);
    }

    /// Deliver `message` as if the latest process for `key` wrote it.
    pub fn deliver(&self, key: &ProcessKey, message: IpcMessage) {
        let notifier = self.latest(key).messages.clone();
        notifier.deliver(message);
    }

    fn launch(&self, key: ProcessKey, channel: ProcessChannel) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SpawnError::Rejected(format!("{} refused to start", key)));
            }
        }
        let pid = {
            let mut next = self.next_pid.lock();
            *next += 1;
            1000 + *next
        };
        let generation = channel.generation();
        let process = Arc::new(FakeProcess {
            key,
            generation,
            pid,
            sent: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            exit: Mutex::new(Some(channel.exit)),
            messages: channel.messages,
        });
        self.processes.lock().push(process.clone());
        Ok(Box::new(FakeHandle { process }))
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn_agent(
        &self,
        agent_name: &str,
        instance_key: &str,
        _spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        self.launch(ProcessKey::agent(agent_name, instance_key), channel)
    }

    fn spawn_connector(
        &self,
        connector_name: &str,
        _spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        self.launch(ProcessKey::connector(connector_name), channel)
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub spawner: Arc<FakeSpawner>,
    pub clock: Arc<ManualClock>,
    pub timer: Arc<ManualTimer>,
    pub events: EventReceiver,
}

impl Harness {
    pub fn new(config: SwarmConfig) -> Self {
        let spawner = Arc::new(FakeSpawner::default());
        let clock = Arc::new(ManualClock::starting_now());
        let timer = Arc::new(ManualTimer::new(clock.clone()));
        let bus = EventBus::new(4096);
        let events = bus.subscribe();
        let orchestrator =
            Orchestrator::new(config, spawner.clone(), clock.clone(), timer.clone(), bus)
                .expect("valid config");
        Self {
            orchestrator,
            spawner,
            clock,
            timer,
            events,
        }
    }

    /// Move time forward, firing due timers.
    pub fn advance(&self, ms: u64) {
        self.timer.advance(Duration::from_millis(ms));
    }

    pub fn drain_events(&mut self) -> Vec<SwarmEvent> {
        self.events.drain()
    }
}

pub fn config(agents: &[&str], connectors: &[&str]) -> SwarmConfig {
    let mut config = SwarmConfig::new("test-swarm", "/tmp/bundle");
    config.desired_agents = agents.iter().map(|s| s.to_string()).collect();
    config.desired_connectors = connectors.iter().map(|s| s.to_string()).collect();
    config
}

pub fn agent(name: &str) -> ProcessKey {
    ProcessKey::default_agent(name)
}

fn event_message(from: &str, to: &str, payload: Value) -> IpcMessage {
    IpcMessage {
        kind: IpcMessageKind::Event,
        from: from.to_string(),
        to: to.to_string(),
        payload: Some(payload),
    }
}

pub fn request(from: &str, to: &str, correlation_id: &str, call_chain: &[&str]) -> IpcMessage {
    event_message(
        from,
        to,
        json!({
            "id": format!("req-{}", correlation_id),
            "type": "request",
            "input": {"task": "review"},
            "source": {"kind": "agent", "name": from},
            "instanceKey": "default",
            "replyTo": {"target": from, "correlationId": correlation_id},
            "target": to,
            "callChain": call_chain,
        }),
    )
}

pub fn request_with_timeout(from: &str, to: &str, correlation_id: &str, timeout_ms: u64) -> IpcMessage {
    let mut message = request(from, to, correlation_id, &[]);
    if let Some(Value::Object(payload)) = message.payload.as_mut() {
        payload.insert("timeoutMs".to_string(), json!(timeout_ms));
    }
    message
}

pub fn response(from: &str, requester: &str, correlation_id: &str, output: &str) -> IpcMessage {
    event_message(
        from,
        requester,
        json!({
            "id": format!("resp-{}-{}", correlation_id, output),
            "type": "response",
            "input": output,
            "source": {"kind": "agent", "name": from},
            "instanceKey": "default",
            "metadata": {"inReplyTo": correlation_id},
        }),
    )
}

pub fn user_message(from: &str, to: &str, text: &str) -> IpcMessage {
    event_message(
        from,
        to,
        json!({
            "id": format!("msg-{}", text),
            "type": "user_message",
            "input": text,
            "source": {"kind": "connector", "name": from},
            "instanceKey": "default",
            "channelHint": "dm",
        }),
    )
}

pub fn error_code(payload: &EventPayload) -> Option<&str> {
    payload.metadata.as_ref()?.error_code.as_deref()
}
