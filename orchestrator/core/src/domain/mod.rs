// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure domain types for worker supervision. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`ipc`] | `IpcMessage`, `EventPayload`, `ReplyTo` |
//! | [`process`] | `ProcessKey`, `ProcessStatus`, `ProcessSnapshot` |
//! | [`backoff`] | `CrashBackoffPolicy`, `CrashOutcome` |
//! | [`desired_state`] | `DesiredState`, `AgentTarget` |
//! | [`spawner`] | `ProcessSpawner`, `ProcessHandle`, `ExitNotifier` |
//! | [`clock`] | `Clock`, `Timer`, `TimerId` |
//! | [`swarm_config`] | `SwarmConfig` |
//! | [`events`] | `SwarmEvent` |

pub mod ipc;
pub mod process;
pub mod backoff;
pub mod desired_state;
pub mod spawner;
pub mod clock;
pub mod swarm_config;
pub mod events;
