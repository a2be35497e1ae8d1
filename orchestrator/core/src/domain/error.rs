// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Mesh Error Taxonomy
//!
//! Every in-process operation of the registry, discovery engine and
//! coordination manager returns [`MeshError`]. Errors are always surfaced to
//! the caller; only the background sweepers log-and-skip.
//!
//! | Variant | Raised for |
//! |---------|-----------|
//! | `Validation` | malformed input (blank ids, empty capability sets, bad load) |
//! | `NotFound` | unknown agent, session or task |
//! | `Conflict` | duplicate ids, stale shared-state versions, dependency cycles |
//! | `State` | operation invalid for the entity's current state |
//! | `Timeout` | heartbeat, task or session expiry |
//! | `Capacity` | malformed discovery bounds (never for empty results) |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Session,
    Task,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Session => f.write_str("session"),
            Self::Task => f.write_str("task"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConflictError {
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Version conflict on key '{key}': expected {expected}, stored {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Cyclic dependency among tasks: {}", tasks.join(", "))]
    CyclicDependency { tasks: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid capacity bounds: {0}")]
    Capacity(String),
}

impl MeshError {
    pub fn agent_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: EntityKind::Agent,
            id: id.to_string(),
        }
    }

    pub fn session_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: EntityKind::Session,
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: EntityKind::Task,
            id: id.to_string(),
        }
    }

    /// Stable label for metrics and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::State(_) => "state",
            Self::Timeout(_) => "timeout",
            Self::Capacity(_) => "capacity",
        }
    }
}
