// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Mesh Core
//!
//! Agent registry, heartbeat liveness, capability discovery and the shared
//! vocabulary (ids, statuses, errors, events, configuration) used by the
//! coordination layer.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Registry, HealthMonitor, DiscoveryEngine, EventBus

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
