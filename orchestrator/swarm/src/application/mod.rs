// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod manager;
pub mod timeout_sweeper;

pub use manager::{CoordinationManager, SessionOptions, TimeoutSweep};
pub use timeout_sweeper::TimeoutSweeper;
