// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use std::time::Duration;

use aegis_swarm_core::events::SwarmEvent;
use aegis_swarm_core::ipc::{IpcMessage, ShutdownPayload, ShutdownReason};
use aegis_swarm_core::process::{ProcessKey, ProcessStatus};
use aegis_swarm_core::spawner::Signal;

use common::{agent, config, request_with_timeout, Harness};

fn shutdown_payload(message: &IpcMessage) -> ShutdownPayload {
    serde_json::from_value(message.payload.clone().expect("payload")).expect("shutdown payload")
}

fn forced_kills(events: &[SwarmEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SwarmEvent::ProcessForceKilled { .. }))
        .count()
}

/// Test 1: Acknowledged shutdown completes without a forced kill
#[test]
fn test_acknowledged_shutdown() {
    let mut h = Harness::new(config(&["coder"], &[]));
    let coder = agent("coder");
    h.orchestrator.reconcile();

    assert!(h
        .orchestrator
        .terminate(&coder, Some(Duration::from_millis(1000))));
    let requests = h.spawner.latest(&coder).shutdown_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].to, "coder");
    let payload = shutdown_payload(&requests[0]);
    assert_eq!(payload.grace_period_ms, 1000);
    assert_eq!(payload.reason, ShutdownReason::Operator);
    assert!(h.orchestrator.record(&coder).is_some_and(|r| r.shutting_down));

    h.spawner
        .deliver(&coder, IpcMessage::shutdown_ack("coder", "default"));
    h.advance(5000);
    assert!(h.spawner.latest(&coder).kills().is_empty());

    h.spawner.exit(&coder, Some(0));
    let record = h.orchestrator.record(&coder).expect("record");
    assert_eq!(record.status, ProcessStatus::Terminated);
    assert!(!record.shutting_down);
    assert_eq!(forced_kills(&h.drain_events()), 0);
}

/// Test 2: Missing acknowledgement escalates to SIGKILL at the deadline
#[test]
fn test_unacknowledged_shutdown_is_force_killed() {
    let mut h = Harness::new(config(&["coder"], &[]));
    let coder = agent("coder");
    h.orchestrator.reconcile();

    h.orchestrator
        .terminate(&coder, Some(Duration::from_millis(1000)));
    h.advance(999);
    assert!(h.spawner.latest(&coder).kills().is_empty());

    h.advance(1);
    assert_eq!(h.spawner.latest(&coder).kills(), vec![Signal::Kill]);
    assert_eq!(forced_kills(&h.drain_events()), 1);

    // A late acknowledgement changes nothing.
    h.spawner
        .deliver(&coder, IpcMessage::shutdown_ack("coder", "default"));
    h.advance(5000);
    assert_eq!(h.spawner.latest(&coder).kills(), vec![Signal::Kill]);

    // Killed on request: not a crash.
    h.spawner.exit(&coder, None);
    let record = h.orchestrator.record(&coder).expect("record");
    assert_eq!(record.status, ProcessStatus::Terminated);
    assert_eq!(record.consecutive_crashes, 0);
}

/// Test 3: The default grace period comes from configuration
#[test]
fn test_default_grace_period() {
    let mut config = config(&[], &["telegram"]);
    config.default_grace_period_ms = 250;
    let h = Harness::new(config);
    let telegram = ProcessKey::connector("telegram");
    h.orchestrator.reconcile();

    assert!(h.orchestrator.terminate(&telegram, None));
    // A second request while draining does not send another shutdown.
    assert!(h.orchestrator.terminate(&telegram, None));
    let requests = h.spawner.latest(&telegram).shutdown_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(shutdown_payload(&requests[0]).grace_period_ms, 250);

    h.advance(250);
    assert_eq!(h.spawner.latest(&telegram).kills(), vec![Signal::Kill]);
}

/// Test 4: Terminating something that is not running reports false
#[test]
fn test_terminate_without_live_process() {
    let h = Harness::new(config(&["coder"], &[]));
    assert!(!h.orchestrator.terminate(&agent("coder"), None));

    h.orchestrator.reconcile();
    h.spawner.exit(&agent("coder"), Some(0));
    assert!(!h.orchestrator.terminate(&agent("coder"), None));
}

/// Test 5: Acknowledgement is matched to the instance that sent it
#[test]
fn test_ack_from_other_instance_is_ignored() {
    let h = Harness::new(config(&[], &[]));
    h.orchestrator.spawn("coder", "chat-1");
    h.orchestrator.spawn("coder", "chat-2");
    let chat_1 = ProcessKey::agent("coder", "chat-1");
    let chat_2 = ProcessKey::agent("coder", "chat-2");

    h.orchestrator
        .terminate(&chat_1, Some(Duration::from_millis(100)));
    h.spawner
        .deliver(&chat_2, IpcMessage::shutdown_ack("coder", "chat-2"));
    h.advance(100);

    assert_eq!(h.spawner.latest(&chat_1).kills(), vec![Signal::Kill]);
    assert!(h.spawner.latest(&chat_2).kills().is_empty());
}

/// Test 6: Orchestrator shutdown drains every worker and stops all activity
#[tokio::test]
async fn test_orchestrator_shutdown_drains() {
    let mut config = config(&["alpha", "beta"], &["telegram"]);
    config.reconcile_interval_ms = 100;
    let h = Harness::new(config);
    let keys = [agent("alpha"), agent("beta"), ProcessKey::connector("telegram")];
    h.orchestrator.reconcile();
    h.orchestrator.start();
    h.spawner
        .deliver(&keys[0], request_with_timeout("alpha", "beta", "corr-1", 60_000));
    assert_eq!(h.orchestrator.pending_requests(), 1);

    h.orchestrator.shutdown();
    for key in &keys {
        let requests = h.spawner.latest(key).shutdown_requests();
        assert_eq!(requests.len(), 1, "{}", key);
        assert_eq!(
            shutdown_payload(&requests[0]).reason,
            ShutdownReason::OrchestratorShutdown
        );
    }
    assert_eq!(h.orchestrator.pending_requests(), 0);
    assert!(h.orchestrator.reconcile().is_empty());
    h.orchestrator.spawn("gamma", "default");
    assert_eq!(h.spawner.spawn_count(&agent("gamma")), 0);

    // Only the three grace timers remain.
    assert_eq!(h.timer.pending(), 3);

    h.spawner.exit(&keys[0], Some(0));
    h.spawner.exit(&keys[1], Some(1));
    assert_eq!(h.orchestrator.live_processes(), 1);

    h.spawner.exit(&keys[2], None);
    tokio::time::timeout(Duration::from_secs(1), h.orchestrator.wait_until_drained())
        .await
        .expect("drained");

    for key in &keys {
        let record = h.orchestrator.record(key).expect("record");
        assert_eq!(record.status, ProcessStatus::Terminated);
        assert_eq!(record.consecutive_crashes, 0);
    }
    assert_eq!(h.timer.pending(), 0);
    assert_eq!(h.spawner.total_spawns(), 3);
}

/// Test 7: Waiting for drain finishes immediately when nothing runs
#[tokio::test]
async fn test_wait_until_drained_with_nothing_running() {
    let h = Harness::new(config(&["coder"], &[]));
    h.orchestrator.shutdown();
    tokio::time::timeout(Duration::from_secs(1), h.orchestrator.wait_until_drained())
        .await
        .expect("drained");
    assert!(h.orchestrator.reconcile().is_empty());
}

/// Test 8: A forced-kill restart still respawns with fresh accounting
#[test]
fn test_restart_after_forced_kill() {
    let mut config = config(&["coder"], &[]);
    config.default_grace_period_ms = 100;
    let h = Harness::new(config);
    let coder = agent("coder");
    h.orchestrator.reconcile();
    h.spawner.exit(&coder, Some(1));
    h.orchestrator.reconcile();

    h.orchestrator.restart("coder");
    h.advance(100);
    assert_eq!(h.spawner.latest(&coder).kills(), vec![Signal::Kill]);
    h.spawner.exit(&coder, None);

    assert_eq!(h.spawner.spawn_count(&coder), 3);
    let record = h.orchestrator.record(&coder).expect("record");
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.consecutive_crashes, 0);
}
