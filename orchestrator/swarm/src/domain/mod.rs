// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Domain Layer
//!
//! Pure domain types for multi-agent coordination. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`task`] | `Task`, `TaskSpec`, `Bid`, `FailureReason` |
//! | [`task_graph`] | `TaskGraph` (per-session DAG, readiness propagation) |
//! | [`shared_state`] | `SharedState` (versioned compare-and-swap store) |
//! | [`pattern`] | `PatternStrategy` and the six pattern strategies |
//! | [`session`] | `CoordinationSession` aggregate, `Effects`, `SessionProgress` |

pub mod pattern;
pub mod session;
pub mod shared_state;
pub mod task;
pub mod task_graph;

pub use pattern::{MergeStrategy, PatternSettings, ProgressSignal};
pub use session::{CoordinationSession, SessionProgress, SessionSnapshot, TaskReport};
pub use shared_state::{SharedState, VersionedValue};
pub use task::{Bid, FailureReason, Task, TaskSpec};
pub use task_graph::{GraphCounts, TaskGraph};
