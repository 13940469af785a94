// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod process_spawner;
pub mod telemetry;
pub mod timer;

pub use event_bus::{EventBus, EventBusError, EventReceiver};
pub use process_spawner::CommandProcessSpawner;
pub use timer::{ManualClock, ManualTimer, SystemClock, TokioTimer};
