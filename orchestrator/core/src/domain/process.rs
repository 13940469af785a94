// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Process Identity & Status
//!
//! - [`ProcessKey`] — identity of a supervised worker (agent instance or connector).
//! - [`ProcessStatus`] — lifecycle status tracked per identity.
//! - [`ProcessSnapshot`] — read-only copy of a process record for observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::ipc::DEFAULT_INSTANCE_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Agent,
    Connector,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Connector => "connector",
        }
    }
}

/// Identity of a supervised worker process.
///
/// At most one record and one live OS process exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessKey {
    Agent { name: String, instance_key: String },
    Connector { name: String },
}

impl ProcessKey {
    pub fn agent(name: impl Into<String>, instance_key: impl Into<String>) -> Self {
        Self::Agent {
            name: name.into(),
            instance_key: instance_key.into(),
        }
    }

    /// Agent key for the `"default"` instance.
    pub fn default_agent(name: impl Into<String>) -> Self {
        Self::agent(name, DEFAULT_INSTANCE_KEY)
    }

    pub fn connector(name: impl Into<String>) -> Self {
        Self::Connector { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Agent { name, .. } | Self::Connector { name } => name,
        }
    }

    pub fn instance_key(&self) -> Option<&str> {
        match self {
            Self::Agent { instance_key, .. } => Some(instance_key),
            Self::Connector { .. } => None,
        }
    }

    pub fn kind(&self) -> ProcessKind {
        match self {
            Self::Agent { .. } => ProcessKind::Agent,
            Self::Connector { .. } => ProcessKind::Connector,
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent { name, instance_key } => write!(f, "agent:{}:{}", name, instance_key),
            Self::Connector { name } => write!(f, "connector:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    /// Known but not running; eligible for an immediate spawn.
    Pending,
    Running,
    /// Throttled after repeated crashes; respawn waits for `next_spawn_allowed_at`.
    CrashLoopBackOff,
    /// Exited cleanly or was shut down on request.
    Terminated,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::CrashLoopBackOff => "crashLoopBackOff",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub key: ProcessKey,
    pub status: ProcessStatus,
    pub consecutive_crashes: u32,
    /// Last applied backoff delay, kept for observability.
    pub backoff_ms: u64,
    pub next_spawn_allowed_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub generation: u64,
    pub shutting_down: bool,
}

impl ProcessSnapshot {
    pub fn is_live(&self) -> bool {
        self.status == ProcessStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_accessors() {
        let agent = ProcessKey::default_agent("coder");
        assert_eq!(agent.name(), "coder");
        assert_eq!(agent.instance_key(), Some("default"));
        assert_eq!(agent.kind(), ProcessKind::Agent);
        assert_eq!(agent.to_string(), "agent:coder:default");

        let connector = ProcessKey::connector("telegram");
        assert_eq!(connector.instance_key(), None);
        assert_eq!(connector.to_string(), "connector:telegram");
    }

    #[test]
    fn test_keys_order_agents_before_connectors() {
        let mut keys = vec![
            ProcessKey::connector("telegram"),
            ProcessKey::agent("beta", "default"),
            ProcessKey::agent("alpha", "chat-9"),
        ];
        keys.sort();
        assert_eq!(keys[0], ProcessKey::agent("alpha", "chat-9"));
        assert_eq!(keys[2], ProcessKey::connector("telegram"));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(ProcessStatus::CrashLoopBackOff).unwrap(),
            serde_json::json!("crashLoopBackOff")
        );
        assert_eq!(ProcessStatus::Terminated.to_string(), "terminated");
    }
}
