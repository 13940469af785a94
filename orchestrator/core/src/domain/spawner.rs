// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Process Spawner Contract
//!
//! The supervisor launches one OS process per agent instance or connector
//! through a [`ProcessSpawner`]. Each spawn receives a [`ProcessChannel`]
//! whose notifiers report back to a single central [`ProcessEventSink`]:
//!
//! - [`MessageNotifier`] — clonable, forwards every inbound [`IpcMessage`].
//! - [`ExitNotifier`] — move-only, consumed by [`ExitNotifier::notify`], so an
//!   exit can be reported at most once per handle.
//!
//! Notifications are stamped with the record generation of the spawn that
//! produced them; the sink discards notifications from superseded processes.
//!
//! Implementations must not invoke either notifier synchronously from inside
//! `spawn_agent`/`spawn_connector`; a process that fails to start is reported
//! by returning [`SpawnError`] instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use thiserror::Error;

use crate::domain::ipc::IpcMessage;
use crate::domain::process::ProcessKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to start worker process: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worker process started without an IPC pipe: {0}")]
    MissingPipe(&'static str),
    #[error("No async runtime available to drive worker process")]
    NoRuntime,
    #[error("Spawn rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("Worker process has exited")]
    Exited,
    #[error("Failed to encode IPC message: {0}")]
    Encode(String),
}

/// Live worker process owned by the supervisor.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Best-effort delivery. Never blocks; fails once the process has exited.
    fn send(&self, message: &IpcMessage) -> Result<(), HandleError>;

    /// Request OS-level termination. Non-blocking.
    fn kill(&self, signal: Signal);
}

/// Central receiver for process notifications.
pub trait ProcessEventSink: Send + Sync {
    fn on_message(&self, key: &ProcessKey, generation: u64, message: IpcMessage);
    fn on_exit(&self, key: &ProcessKey, generation: u64, code: Option<i32>);
}

#[derive(Clone)]
pub struct MessageNotifier {
    sink: Weak<dyn ProcessEventSink>,
    key: ProcessKey,
    generation: u64,
}

impl MessageNotifier {
    pub fn deliver(&self, message: IpcMessage) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_message(&self.key, self.generation, message);
        }
    }

    pub fn key(&self) -> &ProcessKey {
        &self.key
    }
}

pub struct ExitNotifier {
    sink: Weak<dyn ProcessEventSink>,
    key: ProcessKey,
    generation: u64,
}

impl ExitNotifier {
    /// Report the exit code (`None` when terminated by a signal).
    pub fn notify(self, code: Option<i32>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_exit(&self.key, self.generation, code);
        }
    }

    pub fn key(&self) -> &ProcessKey {
        &self.key
    }
}

/// Notification endpoints handed to the spawner for one process.
pub struct ProcessChannel {
    pub messages: MessageNotifier,
    pub exit: ExitNotifier,
}

impl ProcessChannel {
    pub fn new(sink: &Arc<dyn ProcessEventSink>, key: ProcessKey, generation: u64) -> Self {
        Self::from_weak(Arc::downgrade(sink), key, generation)
    }

    pub fn from_weak(sink: Weak<dyn ProcessEventSink>, key: ProcessKey, generation: u64) -> Self {
        Self {
            messages: MessageNotifier {
                sink: sink.clone(),
                key: key.clone(),
                generation,
            },
            exit: ExitNotifier {
                sink,
                key,
                generation,
            },
        }
    }

    pub fn generation(&self) -> u64 {
        self.exit.generation
    }
}

/// Launch parameters shared by every worker of a swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub swarm_name: String,
    pub bundle_dir: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn_agent(
        &self,
        agent_name: &str,
        instance_key: &str,
        spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError>;

    fn spawn_connector(
        &self,
        connector_name: &str,
        spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}
