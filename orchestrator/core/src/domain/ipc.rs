// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # IPC Envelope & Event Payloads
//!
//! Wire types exchanged between the orchestrator and its worker processes.
//! Every message is an [`IpcMessage`] envelope; `event` envelopes carry an
//! [`EventPayload`] whose `type` field selects the routing behaviour.
//!
//! Payloads are forwarded verbatim: fields the orchestrator does not route on
//! are kept in [`EventPayload::extra`] and survive a decode/encode cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Address used by workers when the orchestrator itself is the recipient.
pub const ORCHESTRATOR_ADDRESS: &str = "orchestrator";

/// Instance key used when a caller omits one.
pub const DEFAULT_INSTANCE_KEY: &str = "default";

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMessageKind {
    Event,
    Shutdown,
    ShutdownAck,
}

/// IPC envelope (`{ type, from, to, payload? }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub kind: IpcMessageKind,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl IpcMessage {
    pub fn event(from: impl Into<String>, to: impl Into<String>, payload: &EventPayload) -> Self {
        Self {
            kind: IpcMessageKind::Event,
            from: from.into(),
            to: to.into(),
            payload: Some(payload.to_value()),
        }
    }

    /// Shutdown request sent by the orchestrator to a worker.
    pub fn shutdown(to: impl Into<String>, grace_period_ms: u64, reason: ShutdownReason) -> Self {
        let payload = ShutdownPayload {
            grace_period_ms,
            reason,
        };
        Self {
            kind: IpcMessageKind::Shutdown,
            from: ORCHESTRATOR_ADDRESS.to_string(),
            to: to.into(),
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// Acknowledgement a worker sends once it has started draining.
    pub fn shutdown_ack(from: impl Into<String>, instance_key: impl Into<String>) -> Self {
        let payload = ShutdownAckPayload {
            instance_key: Some(instance_key.into()),
        };
        Self {
            kind: IpcMessageKind::ShutdownAck,
            from: from.into(),
            to: ORCHESTRATOR_ADDRESS.to_string(),
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// Decode the payload of an `event` envelope.
    ///
    /// Returns `None` for other envelope kinds, a missing payload, or a
    /// payload that does not match the event schema.
    pub fn event_payload(&self) -> Option<EventPayload> {
        if self.kind != IpcMessageKind::Event {
            return None;
        }
        self.payload
            .as_ref()
            .and_then(|value| EventPayload::from_value(value).ok())
    }

    pub fn shutdown_ack_payload(&self) -> ShutdownAckPayload {
        self.payload
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether `to` names a worker rather than the orchestrator.
    pub fn is_addressed_to_worker(&self) -> bool {
        !self.to.is_empty() && self.to != ORCHESTRATOR_ADDRESS
    }
}

/// Event payload discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    Notification,
    Request,
    Response,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::Notification => "notification",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Connector,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub kind: SourceKind,
    pub name: String,
}

/// Where the response to a `request` must be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub target: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an `event` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub input: Value,
    pub source: EventSource,
    #[serde(default = "default_instance_key")]
    pub instance_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventPayload {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Correlation id this payload answers, if it is a response.
    pub fn in_reply_to(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.in_reply_to.as_deref())
    }

    /// Instance key with empty strings treated as absent.
    pub fn instance_key_or_default(&self) -> &str {
        if self.instance_key.is_empty() {
            DEFAULT_INSTANCE_KEY
        } else {
            &self.instance_key
        }
    }

    /// Call chain extended by `requester`. The payload is left untouched.
    pub fn extended_call_chain(&self, requester: &str) -> Vec<String> {
        self.call_chain
            .iter()
            .cloned()
            .chain(std::iter::once(requester.to_string()))
            .collect()
    }

    /// Copy of this payload carrying `call_chain`.
    pub fn with_call_chain(&self, call_chain: Vec<String>) -> Self {
        Self {
            call_chain,
            ..self.clone()
        }
    }
}

fn default_instance_key() -> String {
    DEFAULT_INSTANCE_KEY.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Restart,
    ConfigChange,
    OrchestratorShutdown,
    Operator,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::ConfigChange => "config_change",
            Self::OrchestratorShutdown => "orchestrator_shutdown",
            Self::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownPayload {
    pub grace_period_ms: u64,
    pub reason: ShutdownReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownAckPayload {
    #[serde(default)]
    pub instance_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_payload_parses_routing_fields() {
        let value = json!({
            "id": "evt-1",
            "type": "request",
            "input": "hello beta",
            "source": { "kind": "agent", "name": "alpha" },
            "replyTo": { "target": "alpha", "correlationId": "corr-1" },
            "instanceKey": "default",
            "target": "beta",
            "callChain": ["root"],
            "timeoutMs": 5000,
            "auth": { "actor": "user-7" }
        });

        let payload = EventPayload::from_value(&value).unwrap();
        assert_eq!(payload.kind, EventKind::Request);
        assert_eq!(payload.target.as_deref(), Some("beta"));
        assert_eq!(payload.reply_to.as_ref().unwrap().correlation_id, "corr-1");
        assert_eq!(payload.call_chain, vec!["root".to_string()]);
        assert_eq!(payload.timeout_ms, Some(5000));
        assert_eq!(payload.extra.get("auth"), Some(&json!({ "actor": "user-7" })));
    }

    #[test]
    fn test_unknown_fields_survive_forwarding() {
        let value = json!({
            "id": "evt-2",
            "type": "user_message",
            "input": { "text": "hi" },
            "source": { "kind": "connector", "name": "telegram" },
            "instanceKey": "chat-42",
            "chat": { "id": 42 }
        });

        let payload = EventPayload::from_value(&value).unwrap();
        let round = payload.to_value();
        assert_eq!(round["chat"], json!({ "id": 42 }));
        assert_eq!(round["instanceKey"], "chat-42");
        assert!(round.get("callChain").is_none());
    }

    #[test]
    fn test_missing_instance_key_defaults() {
        let value = json!({
            "id": "evt-3",
            "type": "notification",
            "source": { "kind": "agent", "name": "alpha" },
            "target": "beta"
        });

        let payload = EventPayload::from_value(&value).unwrap();
        assert_eq!(payload.instance_key, DEFAULT_INSTANCE_KEY);
        assert_eq!(payload.input, Value::Null);
    }

    #[test]
    fn test_extended_call_chain_does_not_mutate() {
        let value = json!({
            "id": "evt-4",
            "type": "request",
            "source": { "kind": "agent", "name": "beta" },
            "replyTo": { "target": "beta", "correlationId": "corr-2" },
            "target": "gamma",
            "callChain": ["alpha"]
        });
        let payload = EventPayload::from_value(&value).unwrap();

        let chain = payload.extended_call_chain("beta");
        assert_eq!(chain, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(payload.call_chain, vec!["alpha".to_string()]);

        let forwarded = payload.with_call_chain(chain);
        assert_eq!(forwarded.call_chain.len(), 2);
        assert_eq!(payload.call_chain.len(), 1);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let message = IpcMessage::shutdown("coder", 30_000, ShutdownReason::ConfigChange);
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["type"], "shutdown");
        assert_eq!(wire["from"], ORCHESTRATOR_ADDRESS);
        assert_eq!(wire["payload"]["gracePeriodMs"], 30_000);
        assert_eq!(wire["payload"]["reason"], "config_change");

        let ack: IpcMessage = serde_json::from_value(json!({
            "type": "shutdown_ack",
            "from": "coder",
            "to": "orchestrator",
            "payload": { "instanceKey": "default" }
        }))
        .unwrap();
        assert_eq!(ack.kind, IpcMessageKind::ShutdownAck);
        assert_eq!(ack.shutdown_ack_payload().instance_key.as_deref(), Some("default"));
        assert!(ack.event_payload().is_none());
    }
}
