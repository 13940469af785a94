// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: the [`Orchestrator`] and the reconcile, routing and
//! shutdown logic it drives.

mod orchestrator;
mod reconciler;
mod router;
mod shutdown;
mod state;

pub use orchestrator::{AgentHandle, Orchestrator};
pub use reconciler::{
    ReconciliationResult, RespawnTarget, SpawnTarget, TerminateTarget, TerminationReason,
};
pub use router::RoutingErrorCode;
