// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-swarm-core` — Swarm Supervisor Primitives
//!
//! Pure domain types and infrastructure adapters shared by the swarm
//! supervisor (`aegis-swarm`).
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | IPC envelope, process records, crash backoff policy, desired state, spawner/timer contracts, config |
//! | [`infrastructure`] | Infrastructure | OS process spawner, tokio/manual timers, event bus, tracing setup |

pub mod domain;
pub mod infrastructure;

pub use domain::*;
