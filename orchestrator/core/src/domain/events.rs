// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Mesh Domain Events
//!
//! Facts emitted by the registry, health monitor and coordination manager for
//! observability and audit collaborators. Published through
//! [`crate::infrastructure::event_bus::EventBus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, AgentStatus};
use crate::domain::coordination::{CoordinationPattern, SessionId, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentLifecycleEvent {
    AgentRegistered {
        agent_id: AgentId,
        agent_type: String,
        registered_at: DateTime<Utc>,
    },
    /// Heartbeat silence exceeded `heartbeat_timeout`; agent is UNHEALTHY.
    AgentLost {
        agent_id: AgentId,
        previous_status: AgentStatus,
        silent_for_ms: i64,
        lost_at: DateTime<Utc>,
    },
    /// Silence exceeded `heartbeat_timeout * offline_multiplier`; hard eviction.
    AgentOffline {
        agent_id: AgentId,
        silent_for_ms: i64,
        evicted_at: DateTime<Utc>,
    },
    AgentRecovered {
        agent_id: AgentId,
        previous_status: AgentStatus,
        recovered_at: DateTime<Utc>,
    },
    AgentDeregistered {
        agent_id: AgentId,
        deregistered_at: DateTime<Utc>,
    },
    /// Long-term OFFLINE record moved to the audit archive.
    AgentArchived {
        agent_id: AgentId,
        archived_at: DateTime<Utc>,
    },
}

impl AgentLifecycleEvent {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::AgentRegistered { agent_id, .. }
            | Self::AgentLost { agent_id, .. }
            | Self::AgentOffline { agent_id, .. }
            | Self::AgentRecovered { agent_id, .. }
            | Self::AgentDeregistered { agent_id, .. }
            | Self::AgentArchived { agent_id, .. } => agent_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinationEvent {
    SessionCreated {
        session_id: SessionId,
        coordinator_id: AgentId,
        pattern: CoordinationPattern,
        parent_session: Option<SessionId>,
        created_at: DateTime<Utc>,
    },
    ParticipantJoined {
        session_id: SessionId,
        agent_id: AgentId,
        joined_at: DateTime<Utc>,
    },
    ParticipantLeft {
        session_id: SessionId,
        agent_id: AgentId,
        released_tasks: Vec<TaskId>,
        left_at: DateTime<Utc>,
    },
    TaskReady {
        session_id: SessionId,
        task_id: TaskId,
        ready_at: DateTime<Utc>,
    },
    TaskAssigned {
        session_id: SessionId,
        task_id: TaskId,
        agent_id: AgentId,
        assigned_at: DateTime<Utc>,
    },
    TaskCompleted {
        session_id: SessionId,
        task_id: TaskId,
        result: Option<serde_json::Value>,
        completed_at: DateTime<Utc>,
    },
    TaskFailed {
        session_id: SessionId,
        task_id: TaskId,
        reason: String,
        retry_count: u32,
        /// `true` when the task was requeued rather than failed for good.
        will_retry: bool,
        failed_at: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: SessionId,
        completed_at: DateTime<Utc>,
    },
    SessionFailed {
        session_id: SessionId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    SessionCancelled {
        session_id: SessionId,
        cancelled_at: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::ParticipantJoined { session_id, .. }
            | Self::ParticipantLeft { session_id, .. }
            | Self::TaskReady { session_id, .. }
            | Self::TaskAssigned { session_id, .. }
            | Self::TaskCompleted { session_id, .. }
            | Self::TaskFailed { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionCancelled { session_id, .. } => *session_id,
        }
    }
}
