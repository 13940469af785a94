// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Desired State
//!
//! The operator-declared set of agents and connectors that should be running.
//! Replaced wholesale whenever configuration changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::ipc::DEFAULT_INSTANCE_KEY;
use crate::domain::process::ProcessKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentTarget {
    pub name: String,
    pub instance_key: String,
}

impl AgentTarget {
    pub fn new(name: impl Into<String>, instance_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            instance_key: instance_key.unwrap_or_else(|| DEFAULT_INSTANCE_KEY.to_string()),
        }
    }

    pub fn key(&self) -> ProcessKey {
        ProcessKey::agent(self.name.clone(), self.instance_key.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub agents: BTreeSet<AgentTarget>,
    pub connectors: BTreeSet<String>,
}

impl DesiredState {
    /// Desired state with the `"default"` instance of every named agent.
    pub fn from_names<A, C>(agents: A, connectors: C) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            agents: agents
                .into_iter()
                .map(|name| AgentTarget::new(name, None))
                .collect(),
            connectors: connectors.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_agent_instance(mut self, name: impl Into<String>, instance_key: impl Into<String>) -> Self {
        self.agents.insert(AgentTarget::new(name, Some(instance_key.into())));
        self
    }

    /// Keys that must have a record, in stable order.
    pub fn keys(&self) -> Vec<ProcessKey> {
        self.agents
            .iter()
            .map(AgentTarget::key)
            .chain(self.connectors.iter().map(ProcessKey::connector))
            .collect()
    }

    pub fn has_agent_name(&self, name: &str) -> bool {
        self.agents.iter().any(|target| target.name == name)
    }

    /// Whether `key` belongs to a desired agent or connector by name.
    ///
    /// Used for instances started on demand, which stay up while their
    /// agent is desired. Declared identities are matched with
    /// [`declares`](Self::declares).
    pub fn manages(&self, key: &ProcessKey) -> bool {
        match key {
            ProcessKey::Agent { name, .. } => self.has_agent_name(name),
            ProcessKey::Connector { name } => self.connectors.contains(name),
        }
    }

    /// Whether `key` is explicitly declared.
    pub fn declares(&self, key: &ProcessKey) -> bool {
        match key {
            ProcessKey::Agent { name, instance_key } => self.agents.iter().any(|target| {
                &target.name == name && &target.instance_key == instance_key
            }),
            ProcessKey::Connector { name } => self.connectors.contains(name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.connectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_names_uses_default_instance() {
        let desired = DesiredState::from_names(["coder", "reviewer"], ["telegram"]);
        assert!(desired.declares(&ProcessKey::default_agent("coder")));
        assert!(!desired.declares(&ProcessKey::agent("coder", "chat-1")));
        assert!(desired.declares(&ProcessKey::connector("telegram")));
        assert_eq!(desired.keys().len(), 3);
    }

    #[test]
    fn test_agents_are_managed_by_name() {
        let desired = DesiredState::from_names(["coder"], Vec::<String>::new());
        assert!(desired.manages(&ProcessKey::agent("coder", "chat-1")));
        assert!(!desired.manages(&ProcessKey::default_agent("reviewer")));
        assert!(!desired.manages(&ProcessKey::connector("coder")));
    }

    #[test]
    fn test_explicit_instances() {
        let desired = DesiredState::default().with_agent_instance("coder", "team-a");
        assert!(desired.declares(&ProcessKey::agent("coder", "team-a")));
        assert!(!desired.declares(&ProcessKey::default_agent("coder")));
        assert!(!desired.is_empty());
    }
}
