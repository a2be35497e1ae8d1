// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-mesh-swarm`: Multi-Pattern Task Coordination
//!
//! Coordination sessions between a coordinator agent and its participants,
//! each following one of six patterns (SWARM, PIPELINE, HIERARCHICAL,
//! CONSENSUS, AUCTION, COLLABORATIVE) over a per-session task DAG and a
//! versioned shared-state store.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `CoordinationSession`, `TaskGraph`, `SharedState`, pattern strategies |
//! | [`application`] | Application | `CoordinationManager`, `TimeoutSweeper` |
//!
//! ## Key Concepts
//!
//! - **Readiness propagation**: completing a task promotes its dependents to
//!   READY within the same call, under the session lock.
//! - **Failure policy**: isolating patterns cancel only the failed task's
//!   dependents; PIPELINE and HIERARCHICAL fail the whole session.
//! - **Cascade cancellation**: cancelling or failing a session cancels the
//!   child sessions opened by HIERARCHICAL delegation.
//!
//! Agents are resolved through the
//! [`AgentRegistry`](aegis_mesh_core::application::registry::AgentRegistry)
//! of `aegis-mesh-core`; only ACTIVE or DEGRADED agents receive work.

pub mod application;
pub mod domain;

pub use application::{CoordinationManager, SessionOptions, TimeoutSweeper};
pub use domain::*;
