// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod discovery;
pub mod health_monitor;
pub mod registry;

pub use discovery::{DiscoveryEngine, DiscoveryMatch, DiscoveryQuery, TagMatch};
pub use health_monitor::{HealthMonitor, SweepReport};
pub use registry::{AgentRegistry, LivenessOutcome};
