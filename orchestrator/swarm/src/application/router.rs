// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Router
//!
//! Dispatches inbound IPC traffic between workers.
//!
//! | Inbound | Handling |
//! |---------|----------|
//! | `user_message` / `notification` | forwarded unchanged to the resolved target, started on demand |
//! | `request` | cycle and depth checked, correlated by `replyTo.correlationId`, forwarded with the extended `callChain` |
//! | `response` | delivered once to the requester recorded for `metadata.inReplyTo`, otherwise dropped |
//! | `shutdown_ack` | handed to the shutdown coordinator |
//! | `shutdown` | ignored (orchestrator-to-worker only) |
//!
//! Rejected and timed-out requests are answered with a synthesized
//! `response` from `"orchestrator"` carrying `metadata.errorCode`.

use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use aegis_swarm_core::backoff::after;
use aegis_swarm_core::events::SwarmEvent;
use aegis_swarm_core::ipc::{
    EventKind, EventMetadata, EventPayload, EventSource, IpcMessage, IpcMessageKind, SourceKind,
    ORCHESTRATOR_ADDRESS,
};
use aegis_swarm_core::process::ProcessKey;

use super::orchestrator::Inner;
use super::state::{ArmedTimer, PendingCorrelation, SwarmState};

/// Error codes carried in `metadata.errorCode` of synthesized responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingErrorCode {
    CircularCallDetected,
    CallDepthExceeded,
    TargetUnavailable,
    RequestTimeout,
}

impl RoutingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircularCallDetected => "CIRCULAR_CALL_DETECTED",
            Self::CallDepthExceeded => "CALL_DEPTH_EXCEEDED",
            Self::TargetUnavailable => "TARGET_UNAVAILABLE",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

struct Rejection {
    code: RoutingErrorCode,
    message: String,
}

impl Inner {
    /// Entry point for every inbound message. `origin` is the sending
    /// process and its generation when the message came over IPC.
    pub(crate) fn route(&self, message: IpcMessage, origin: Option<(&ProcessKey, u64)>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match message.kind {
            IpcMessageKind::ShutdownAck => self.handle_shutdown_ack(state, &message, origin),
            IpcMessageKind::Shutdown => {
                debug!(from = %message.from, "Ignoring shutdown message sent to orchestrator");
            }
            IpcMessageKind::Event => {
                let Some(payload) = message.event_payload() else {
                    debug!(from = %message.from, "Dropping event without a valid payload");
                    return;
                };
                match payload.kind {
                    EventKind::Response => self.route_response(state, &message, &payload),
                    EventKind::Request if payload.reply_to.is_some() => {
                        self.route_request(state, &message, &payload)
                    }
                    EventKind::Request | EventKind::UserMessage | EventKind::Notification => {
                        self.route_one_way(state, &message, &payload)
                    }
                }
            }
        }
    }

    fn route_one_way(&self, state: &mut SwarmState, message: &IpcMessage, payload: &EventPayload) {
        let Some(target) = resolve_target(message, payload) else {
            debug!(from = %message.from, event_id = %payload.id, "Dropping event without a target");
            return;
        };
        let key = state.address_key(&target, payload.instance_key_or_default());
        if !self.ensure_running(state, &key) {
            warn!(
                swarm_name = %self.config.swarm_name,
                from = %message.from,
                target = %key,
                event_type = payload.kind.as_str(),
                "Dropping message for unavailable worker"
            );
            count_rejection(RoutingErrorCode::TargetUnavailable);
            return;
        }

        let forwarded = IpcMessage {
            kind: IpcMessageKind::Event,
            from: message.from.clone(),
            to: target,
            payload: message.payload.clone(),
        };
        self.deliver(state, &key, &forwarded, payload.kind);
    }

    fn route_request(&self, state: &mut SwarmState, message: &IpcMessage, payload: &EventPayload) {
        let Some(reply_to) = payload.reply_to.as_ref() else {
            return;
        };
        let Some(target) = resolve_target(message, payload) else {
            debug!(
                from = %message.from,
                correlation_id = %reply_to.correlation_id,
                "Dropping request without a target"
            );
            return;
        };

        let requester = state.requester_key(&reply_to.target, payload.instance_key_or_default());
        let call_chain = payload.extended_call_chain(&message.from);

        let rejection = if call_chain.iter().any(|hop| *hop == target) {
            Some(Rejection {
                code: RoutingErrorCode::CircularCallDetected,
                message: format!(
                    "Circular call detected: {} -> {}",
                    call_chain.join(" -> "),
                    target
                ),
            })
        } else if call_chain.len() > self.config.max_call_depth {
            Some(Rejection {
                code: RoutingErrorCode::CallDepthExceeded,
                message: format!(
                    "Call depth {} exceeds the maximum of {}",
                    call_chain.len(),
                    self.config.max_call_depth
                ),
            })
        } else {
            None
        };

        let target_key = state.address_key(&target, payload.instance_key_or_default());
        let rejection = rejection.or_else(|| {
            (!self.ensure_running(state, &target_key)).then(|| Rejection {
                code: RoutingErrorCode::TargetUnavailable,
                message: format!("Target {} is unavailable", target),
            })
        });

        if let Some(rejection) = rejection {
            warn!(
                swarm_name = %self.config.swarm_name,
                from = %message.from,
                target = %target,
                correlation_id = %reply_to.correlation_id,
                error_code = rejection.code.as_str(),
                call_chain = ?call_chain,
                "Request rejected"
            );
            count_rejection(rejection.code);
            self.events.publish(SwarmEvent::RoutingRejected {
                from: message.from.clone(),
                target: target.clone(),
                correlation_id: Some(reply_to.correlation_id.clone()),
                error_code: rejection.code.as_str().to_string(),
                rejected_at: self.clock.now(),
            });
            self.send_error_response(
                state,
                &requester,
                &reply_to.correlation_id,
                &target,
                payload.trace_id.clone(),
                rejection,
            );
            return;
        }

        let correlation_id = reply_to.correlation_id.clone();
        let now = self.clock.now();
        let timeout = payload.timeout_ms.map(|timeout_ms| {
            let token = state.next_token();
            let weak = self.weak.clone();
            let timer_correlation = correlation_id.clone();
            let id = self.timer.set_timeout(
                Duration::from_millis(timeout_ms),
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_request_timeout(&timer_correlation, token);
                    }
                }),
            );
            ArmedTimer { id, token }
        });
        let pending = PendingCorrelation {
            requester,
            target: target.clone(),
            call_chain: call_chain.clone(),
            trace_id: payload.trace_id.clone(),
            deadline: payload.timeout_ms.map(|ms| after(now, ms)),
            timeout,
        };
        if let Some(replaced) = state.correlations.insert(correlation_id.clone(), pending) {
            if let Some(timer) = replaced.timeout {
                self.timer.clear_timeout(timer.id);
            }
            warn!(
                swarm_name = %self.config.swarm_name,
                correlation_id = %correlation_id,
                previous_target = %replaced.target,
                "Correlation id reused while still pending, replacing"
            );
        }

        let forwarded = IpcMessage::event(
            message.from.clone(),
            target,
            &payload.with_call_chain(call_chain),
        );
        self.deliver(state, &target_key, &forwarded, EventKind::Request);
    }

    fn route_response(&self, state: &mut SwarmState, message: &IpcMessage, payload: &EventPayload) {
        let Some(correlation_id) = payload.in_reply_to() else {
            debug!(from = %message.from, event_id = %payload.id, "Dropping response without inReplyTo");
            return;
        };
        let Some(pending) = state.correlations.remove(correlation_id) else {
            debug!(
                from = %message.from,
                correlation_id,
                "Dropping response for unknown or completed correlation"
            );
            return;
        };
        if let Some(timer) = pending.timeout {
            self.timer.clear_timeout(timer.id);
        }

        if !self.ensure_running(state, &pending.requester) {
            warn!(
                swarm_name = %self.config.swarm_name,
                requester = %pending.requester,
                correlation_id,
                "Requester unavailable, dropping response"
            );
            count_rejection(RoutingErrorCode::TargetUnavailable);
            return;
        }

        let forwarded = IpcMessage {
            kind: IpcMessageKind::Event,
            from: message.from.clone(),
            to: pending.requester.name().to_string(),
            payload: message.payload.clone(),
        };
        self.deliver(state, &pending.requester, &forwarded, EventKind::Response);
    }

    fn on_request_timeout(&self, correlation_id: &str, token: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let armed = state
            .correlations
            .get(correlation_id)
            .and_then(|pending| pending.timeout)
            .map(|timer| timer.token);
        if armed != Some(token) {
            return;
        }
        let Some(pending) = state.correlations.remove(correlation_id) else {
            return;
        };

        warn!(
            swarm_name = %self.config.swarm_name,
            correlation_id,
            requester = %pending.requester,
            target = %pending.target,
            deadline = ?pending.deadline,
            "Request timed out"
        );
        count_rejection(RoutingErrorCode::RequestTimeout);
        self.events.publish(SwarmEvent::RequestTimedOut {
            correlation_id: correlation_id.to_string(),
            requester: pending.requester.clone(),
            target: pending.target.clone(),
            timed_out_at: self.clock.now(),
        });

        let message = format!("Request to {} timed out", pending.target);
        self.send_error_response(
            state,
            &pending.requester,
            correlation_id,
            &pending.target,
            pending.trace_id.clone(),
            Rejection {
                code: RoutingErrorCode::RequestTimeout,
                message,
            },
        );
    }

    /// Live process for `key`, started on demand. Crash-loop gating is
    /// honoured, and nothing starts once the orchestrator is shutting down.
    fn ensure_running(&self, state: &mut SwarmState, key: &ProcessKey) -> bool {
        if let Some(record) = state.records.get(key) {
            if record.is_live() {
                return true;
            }
            if record.is_gated(self.clock.now()) {
                return false;
            }
        }
        if state.shutting_down {
            return false;
        }
        info!(swarm_name = %self.config.swarm_name, process = %key, "Starting worker on demand");
        self.spawn_process(state, key)
    }

    fn deliver(&self, state: &SwarmState, key: &ProcessKey, message: &IpcMessage, kind: EventKind) {
        let Some(handle) = state.records.get(key).and_then(|r| r.handle.as_ref()) else {
            debug!(process = %key, "No live process to deliver to");
            return;
        };
        match handle.send(message) {
            Ok(()) => {
                metrics::counter!("aegis_swarm_messages_routed_total", "type" => kind.as_str())
                    .increment(1);
            }
            Err(error) => debug!(process = %key, error = %error, "Delivery failed"),
        }
    }

    /// Answer a request on the orchestrator's behalf. Only delivered if the
    /// requester is live.
    fn send_error_response(
        &self,
        state: &SwarmState,
        requester: &ProcessKey,
        correlation_id: &str,
        responder: &str,
        trace_id: Option<String>,
        rejection: Rejection,
    ) {
        let payload = EventPayload {
            id: Uuid::new_v4().to_string(),
            kind: EventKind::Response,
            input: Value::Null,
            source: EventSource {
                kind: SourceKind::Agent,
                name: responder.to_string(),
            },
            instance_key: requester
                .instance_key()
                .map(str::to_string)
                .unwrap_or_default(),
            trace_id,
            reply_to: None,
            target: None,
            call_chain: Vec::new(),
            timeout_ms: None,
            metadata: Some(EventMetadata {
                in_reply_to: Some(correlation_id.to_string()),
                error_code: Some(rejection.code.as_str().to_string()),
                error_message: Some(rejection.message),
                extra: Map::new(),
            }),
            extra: Map::new(),
        };
        let message = IpcMessage::event(ORCHESTRATOR_ADDRESS, requester.name(), &payload);
        self.deliver(state, requester, &message, EventKind::Response);
    }
}

/// `to` unless it names the orchestrator, then `payload.target`, then
/// `replyTo.target`.
fn resolve_target(message: &IpcMessage, payload: &EventPayload) -> Option<String> {
    if message.is_addressed_to_worker() {
        return Some(message.to.clone());
    }
    payload
        .target
        .as_ref()
        .filter(|target| !target.is_empty())
        .or_else(|| payload.reply_to.as_ref().map(|reply_to| &reply_to.target))
        .cloned()
}

fn count_rejection(code: RoutingErrorCode) {
    metrics::counter!("aegis_swarm_routing_rejections_total", "code" => code.as_str()).increment(1);
}
