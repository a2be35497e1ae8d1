// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Entity
//!
//! A unit of work inside a coordination session's task graph.
//!
//! A task is held either by a single `assignee` (SWARM, PIPELINE,
//! HIERARCHICAL, AUCTION) or by a `cohort` of members (CONSENSUS,
//! COLLABORATIVE). In both cases only a READY task can be handed out, which
//! keeps at most one concurrent assignment per task.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use aegis_mesh_core::domain::agent::AgentId;
use aegis_mesh_core::domain::coordination::{SessionId, TaskId, TaskStatus};
use aegis_mesh_core::domain::error::MeshError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plan entry used to define a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Capabilities an assignee must declare.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Stage owner for PIPELINE sessions.
    #[serde(default)]
    pub designated_agent: Option<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn requires<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn designated(mut self, agent: impl Into<String>) -> Self {
        self.designated_agent = Some(agent.into());
        self
    }
}

/// A sealed bid in an AUCTION session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub agent_id: AgentId,
    pub cost: f64,
    #[serde(with = "humantime_serde")]
    pub eta: Duration,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionWindow {
    pub opened_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    /// Times the window was reopened because nobody bid.
    pub reopen_count: u32,
    pub awarded_to: Option<AgentId>,
}

impl AuctionWindow {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.awarded_to.is_none() && now <= self.closes_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Assigned,
    Running,
    Reported,
    Failed,
}

impl MemberStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

/// One agent's share of a cohort task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMember {
    pub status: MemberStatus,
    /// Vote (CONSENSUS) or partial contribution (COLLABORATIVE).
    pub result: Option<Value>,
    pub joined_at: DateTime<Utc>,
    pub reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Reported by the assignee.
    Reported(String),
    /// No progress within the task timeout.
    Timeout,
    /// Consensus was not reached within the resolution rounds.
    Disagreement,
    /// Not enough contributors remain to reach the completeness threshold.
    Unreachable,
    /// Auction closed without bids more times than allowed.
    NoBids,
    /// The delegated child session did not complete.
    ChildSession(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported(reason) => write!(f, "reported: {reason}"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::Disagreement => f.write_str("consensus not reached"),
            Self::Unreachable => f.write_str("completeness threshold unreachable"),
            Self::NoBids => f.write_str("no bids received"),
            Self::ChildSession(reason) => write!(f, "child session: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub description: String,
    pub dependencies: BTreeSet<TaskId>,
    pub required_capabilities: BTreeSet<String>,
    pub designated_agent: Option<AgentId>,
    pub status: TaskStatus,
    pub assignee: Option<AgentId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cohort: BTreeMap<AgentId, CohortMember>,
    /// Agreeing votes or contributions required to finish a cohort task.
    pub cohort_target: Option<usize>,
    pub result: Option<Value>,
    pub retry_count: u32,
    pub resolution_rounds: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bids: Vec<Bid>,
    pub auction: Option<AuctionWindow>,
    pub child_session: Option<SessionId>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Assignment time or last report; drives the task timeout.
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn from_spec(
        spec: TaskSpec,
        session_id: SessionId,
        dependencies: BTreeSet<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<Self, MeshError> {
        let designated_agent = spec.designated_agent.map(AgentId::parse).transpose()?;
        Ok(Self {
            id: TaskId::parse(spec.id)?,
            session_id,
            description: spec.description,
            dependencies,
            required_capabilities: spec.required_capabilities,
            designated_agent,
            status: TaskStatus::Pending,
            assignee: None,
            cohort: BTreeMap::new(),
            cohort_target: None,
            result: None,
            retry_count: 0,
            resolution_rounds: 0,
            bids: Vec::new(),
            auction: None,
            child_session: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            last_progress_at: None,
        })
    }

    /// Whether `agent` currently holds this task.
    pub fn holds(&self, agent: &AgentId) -> bool {
        if !self.status.is_in_flight() {
            return false;
        }
        self.assignee.as_ref() == Some(agent)
            || self
                .cohort
                .get(agent)
                .is_some_and(|member| member.status.is_pending())
    }

    pub fn pending_members(&self) -> usize {
        self.cohort.values().filter(|m| m.status.is_pending()).count()
    }

    pub fn reported_members(&self) -> usize {
        self.cohort
            .values()
            .filter(|m| m.status == MemberStatus::Reported)
            .count()
    }

    pub fn failed_members(&self) -> usize {
        self.cohort
            .values()
            .filter(|m| m.status == MemberStatus::Failed)
            .count()
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub(crate) fn assign(&mut self, agent: AgentId, now: DateTime<Utc>) {
        self.assignee = Some(agent);
        self.last_progress_at = Some(now);
        self.set_status(TaskStatus::Assigned, now);
    }

    pub(crate) fn assign_cohort(&mut self, agents: Vec<AgentId>, target: usize, now: DateTime<Utc>) {
        self.cohort = agents
            .into_iter()
            .map(|agent| {
                (
                    agent,
                    CohortMember {
                        status: MemberStatus::Assigned,
                        result: None,
                        joined_at: now,
                        reported_at: None,
                    },
                )
            })
            .collect();
        self.cohort_target = Some(target);
        self.last_progress_at = Some(now);
        self.set_status(TaskStatus::Assigned, now);
    }

    /// Note a report from a holder, moving ASSIGNED to RUNNING.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_progress_at = Some(now);
        if self.status == TaskStatus::Assigned {
            self.set_status(TaskStatus::Running, now);
        } else {
            self.updated_at = now;
        }
    }

    /// Return the task to READY with every holder cleared.
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) {
        self.assignee = None;
        self.cohort.clear();
        self.cohort_target = None;
        self.bids.clear();
        self.auction = None;
        self.child_session = None;
        self.last_progress_at = None;
        self.set_status(TaskStatus::Ready, now);
    }

    /// Drop holders without touching retained results.
    pub(crate) fn release_holders(&mut self) {
        self.assignee = None;
        for member in self.cohort.values_mut() {
            if member.status.is_pending() {
                member.status = MemberStatus::Failed;
            }
        }
    }

    /// Start a fresh consensus round: votes are cleared and reporters re-run.
    pub(crate) fn reset_round(&mut self, now: DateTime<Utc>) {
        for member in self.cohort.values_mut() {
            if member.status == MemberStatus::Reported {
                member.status = MemberStatus::Assigned;
                member.result = None;
                member.reported_at = None;
            }
        }
        self.resolution_rounds += 1;
        self.last_progress_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::from_spec(
            TaskSpec::new("t1", "do work"),
            SessionId::new(),
            BTreeSet::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn blank_task_id_is_rejected() {
        let result = Task::from_spec(TaskSpec::new(" ", ""), SessionId::new(), BTreeSet::new(), Utc::now());
        assert!(matches!(result, Err(MeshError::Validation(_))));
    }

    #[test]
    fn only_in_flight_holders_hold() {
        let mut task = task();
        let agent = AgentId::parse("w1").unwrap();
        task.set_status(TaskStatus::Ready, Utc::now());
        assert!(!task.holds(&agent));

        task.assign(agent.clone(), Utc::now());
        assert!(task.holds(&agent));
        assert!(!task.holds(&AgentId::parse("w2").unwrap()));

        task.requeue(Utc::now());
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.assignee.is_none());
    }

    #[test]
    fn reset_round_keeps_failed_members_out() {
        let mut task = task();
        let now = Utc::now();
        task.assign_cohort(vec![AgentId::parse("a").unwrap(), AgentId::parse("b").unwrap()], 2, now);
        if let Some(member) = task.cohort.get_mut(&AgentId::parse("a").unwrap()) {
            member.status = MemberStatus::Reported;
            member.result = Some(Value::from(1));
        }
        if let Some(member) = task.cohort.get_mut(&AgentId::parse("b").unwrap()) {
            member.status = MemberStatus::Failed;
        }

        task.reset_round(now);
        assert_eq!(task.resolution_rounds, 1);
        assert_eq!(task.pending_members(), 1);
        assert_eq!(task.reported_members(), 0);
    }
}
