// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-swarm` — Swarm Supervisor
//!
//! Keeps a swarm's agent and connector processes converged on a declared
//! desired state, and brokers all messages between them.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`application`] | Application | [`Orchestrator`], [`AgentHandle`], reconcile results |
//!
//! Domain types (process keys, the IPC protocol, the crash backoff policy,
//! the spawner and timer ports) live in `aegis-swarm-core`.
//!
//! ## Key Concepts
//!
//! - **Reconciliation**: each pass diffs desired against actual and acts on
//!   the difference. Passes are serialized; a pass with nothing to do
//!   reports an empty [`ReconciliationResult`].
//! - **Crash-loop backoff**: after `crash_threshold` consecutive crashes a
//!   worker is not respawned until an exponentially growing delay elapses.
//!   A clean exit or an operator restart resets the count.
//! - **Routing**: every message goes through the orchestrator. Requests are
//!   correlated, guarded against call cycles and excessive depth, and time
//!   out with a synthesized error response.
//! - **Shutdown handshake**: `shutdown` → `shutdown_ack` within the grace
//!   period, else SIGKILL.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aegis_swarm::Orchestrator;
//! use aegis_swarm_core::infrastructure::{CommandProcessSpawner, EventBus, SystemClock, TokioTimer};
//! use aegis_swarm_core::swarm_config::SwarmConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = SwarmConfig::from_yaml_file("swarm.yaml")?;
//! let spawner = Arc::new(CommandProcessSpawner::new(config.runner.clone()));
//! let orchestrator = Orchestrator::new(
//!     config,
//!     spawner,
//!     Arc::new(SystemClock),
//!     Arc::new(TokioTimer::try_current()?),
//!     EventBus::with_default_capacity(),
//! )?;
//! orchestrator.reconcile();
//! orchestrator.start();
//!
//! tokio::signal::ctrl_c().await?;
//! orchestrator.shutdown();
//! orchestrator.wait_until_drained().await;
//! # Ok(())
//! # }
//! ```

pub mod application;

pub use application::*;
