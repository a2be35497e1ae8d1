// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Session Aggregate
//!
//! A bounded collaboration between a coordinator and its participants,
//! following one [`CoordinationPattern`]. The session owns its task graph and
//! shared state; every mutation happens under the session's lock in the
//! [`CoordinationManager`](crate::application::manager::CoordinationManager).
//!
//! Mutations return [`Effects`]: events to publish plus follow-ups that touch
//! other aggregates (parent/child sessions, the agent registry). The manager
//! applies them after releasing the lock, so two session locks are never
//! held at once.
//!
//! ## State Machine
//!
//! ```text
//! CREATED ─► ACTIVE ◄──► PAUSED
//!              │
//!              ├─► COMPLETED
//!              ├─► FAILED      (terminal: no further transitions)
//!              └─► CANCELLED
//! ```

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use aegis_mesh_core::domain::agent::{AgentId, AgentRecord};
use aegis_mesh_core::domain::coordination::{
    CoordinationPattern, SessionId, SessionStatus, TaskId, TaskStatus,
};
use aegis_mesh_core::domain::error::{ConflictError, MeshError};
use aegis_mesh_core::domain::events::CoordinationEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::pattern::{
    select_winner, strategy_for, FailurePolicy, PatternSettings, PatternStrategy, ProgressSignal,
    Verdict,
};
use super::shared_state::{SharedState, VersionedValue};
use super::task::{AuctionWindow, Bid, FailureReason, MemberStatus, Task, TaskSpec};
use super::task_graph::TaskGraph;

/// Retry and timing rules resolved at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub max_retries: u32,
    pub task_timeout: Duration,
    pub bid_window: Duration,
}

/// Link from a child session back to the delegated parent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub session_id: SessionId,
    pub task_id: TaskId,
}

/// Terminal outcome of a child session as seen by its parent task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Completed(Option<Value>),
    Failed(String),
    Cancelled,
}

/// Work the manager performs on other aggregates after unlocking.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    PropagateToParent {
        link: ParentLink,
        child: SessionId,
        outcome: ChildOutcome,
    },
    CancelSession(SessionId),
    FlagDegraded { agent: AgentId, reason: String },
    ClearFlag(AgentId),
}

/// Why a cohort task is being re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettleCause {
    /// A member reported a result or a failure.
    Report,
    /// A member left the session or was deregistered.
    Released,
    /// Pending members missed the task timeout.
    TimedOut,
}

#[derive(Debug, Default)]
pub struct Effects {
    pub events: Vec<CoordinationEvent>,
    pub follow_ups: Vec<FollowUp>,
    /// Tasks whose holders missed the task timeout.
    pub timed_out: usize,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.follow_ups.is_empty() && self.timed_out == 0
    }

    fn push(&mut self, event: CoordinationEvent) {
        self.events.push(event);
    }

    fn follow_up(&mut self, follow_up: FollowUp) {
        self.follow_ups.push(follow_up);
    }

    pub(crate) fn merge(&mut self, other: Effects) {
        self.events.extend(other.events);
        self.follow_ups.extend(other.follow_ups);
        self.timed_out += other.timed_out;
    }
}

/// Progress report from a task holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// RUNNING, COMPLETED or FAILED.
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TaskReport {
    pub fn running() -> Self {
        Self {
            status: TaskStatus::Running,
            result: None,
            reason: None,
        }
    }

    pub fn completed(result: impl Into<Option<Value>>) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: result.into(),
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub pattern: CoordinationPattern,
    pub completed: usize,
    pub total: usize,
    /// `completed / total`, `0.0` for an empty graph.
    pub ratio: f64,
    pub failed: usize,
    pub cancelled: usize,
    pub signal: ProgressSignal,
}

/// Read-only copy of a session for inspection and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub coordinator_id: AgentId,
    pub pattern: CoordinationPattern,
    pub goal: String,
    pub status: SessionStatus,
    pub participants: Vec<AgentId>,
    pub tasks: Vec<Task>,
    pub shared_state: SharedState,
    pub parent: Option<ParentLink>,
    pub children: Vec<SessionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

pub(crate) struct SessionParams {
    pub coordinator_id: AgentId,
    pub pattern: CoordinationPattern,
    pub goal: String,
    pub settings: PatternSettings,
    pub policy: SessionPolicy,
    pub session_timeout: Duration,
    pub parent: Option<ParentLink>,
}

/// `now + duration`, saturating at the latest representable instant.
pub(crate) fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug)]
pub struct CoordinationSession {
    id: SessionId,
    coordinator_id: AgentId,
    pattern: CoordinationPattern,
    goal: String,
    status: SessionStatus,
    participants: BTreeMap<AgentId, Participation>,
    graph: TaskGraph,
    shared_state: SharedState,
    parent: Option<ParentLink>,
    children: BTreeSet<SessionId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    failure_reason: Option<String>,
    policy: SessionPolicy,
    strategy: Arc<dyn PatternStrategy>,
}

impl CoordinationSession {
    pub(crate) fn new(id: SessionId, params: SessionParams, now: DateTime<Utc>) -> Self {
        Self {
            id,
            coordinator_id: params.coordinator_id,
            pattern: params.pattern,
            goal: params.goal,
            status: SessionStatus::Created,
            participants: BTreeMap::new(),
            graph: TaskGraph::new(),
            shared_state: SharedState::new(),
            parent: params.parent,
            children: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            deadline: deadline_after(now, params.session_timeout),
            failure_reason: None,
            policy: params.policy,
            strategy: strategy_for(params.pattern, &params.settings),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn coordinator_id(&self) -> &AgentId {
        &self.coordinator_id
    }

    pub fn pattern(&self) -> CoordinationPattern {
        self.pattern
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_participant(&self, agent: &AgentId) -> bool {
        self.participants
            .get(agent)
            .is_some_and(|p| p.left_at.is_none())
    }

    pub(crate) fn created_event(&self) -> CoordinationEvent {
        CoordinationEvent::SessionCreated {
            session_id: self.id,
            coordinator_id: self.coordinator_id.clone(),
            pattern: self.pattern,
            parent_session: self.parent.as_ref().map(|link| link.session_id),
            created_at: self.created_at,
        }
    }

    // Lifecycle

    pub(crate) fn start(&mut self, now: DateTime<Utc>) -> Result<(), MeshError> {
        match self.status {
            SessionStatus::Created => {
                self.status = SessionStatus::Active;
                self.updated_at = now;
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            status => Err(MeshError::State(format!(
                "cannot start session {} from {status}",
                self.id
            ))),
        }
    }

    pub(crate) fn pause(&mut self, now: DateTime<Utc>) -> Result<(), MeshError> {
        match self.status {
            SessionStatus::Active => {
                self.status = SessionStatus::Paused;
                self.updated_at = now;
                Ok(())
            }
            SessionStatus::Paused => Ok(()),
            status => Err(MeshError::State(format!(
                "cannot pause session {} from {status}",
                self.id
            ))),
        }
    }

    pub(crate) fn resume(&mut self, now: DateTime<Utc>) -> Result<(), MeshError> {
        match self.status {
            SessionStatus::Paused => {
                self.status = SessionStatus::Active;
                self.updated_at = now;
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            status => Err(MeshError::State(format!(
                "cannot resume session {} from {status}",
                self.id
            ))),
        }
    }

    /// Idempotent: a terminal session yields no effects.
    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if self.status.is_terminal() {
            return effects;
        }
        let cancelled = self.graph.cancel_all(now);
        self.status = SessionStatus::Cancelled;
        self.updated_at = now;
        info!(session_id = %self.id, cancelled_tasks = cancelled.len(), "Session cancelled");

        effects.push(CoordinationEvent::SessionCancelled {
            session_id: self.id,
            cancelled_at: now,
        });
        self.cascade_to_children(&mut effects);
        self.notify_parent(ChildOutcome::Cancelled, &mut effects);
        effects
    }

    // Membership

    pub(crate) fn add_participant(&mut self, agent: AgentId, now: DateTime<Utc>) -> Result<Effects, MeshError> {
        self.ensure_open()?;
        match self.participants.entry(agent.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().left_at.is_none() {
                    return Err(ConflictError::DuplicateId(agent.to_string()).into());
                }
                let participation = entry.get_mut();
                participation.joined_at = now;
                participation.left_at = None;
            }
            Entry::Vacant(entry) => {
                entry.insert(Participation {
                    joined_at: now,
                    left_at: None,
                });
            }
        }
        self.updated_at = now;

        let mut effects = Effects::default();
        effects.push(CoordinationEvent::ParticipantJoined {
            session_id: self.id,
            agent_id: agent,
            joined_at: now,
        });
        Ok(effects)
    }

    /// Leave the session; held tasks go back to READY.
    pub(crate) fn remove_participant(&mut self, agent: &AgentId, now: DateTime<Utc>) -> Result<Effects, MeshError> {
        self.ensure_open()?;
        let Some(participation) = self
            .participants
            .get_mut(agent)
            .filter(|p| p.left_at.is_none())
        else {
            return Err(MeshError::agent_not_found(agent));
        };
        participation.left_at = Some(now);
        self.updated_at = now;

        let mut effects = Effects::default();
        let released_tasks = self.release_holdings(agent, now, &mut effects);
        effects.push(CoordinationEvent::ParticipantLeft {
            session_id: self.id,
            agent_id: agent.clone(),
            released_tasks,
            left_at: now,
        });
        Ok(effects)
    }

    /// Free every task held by an agent that stopped being reachable.
    pub(crate) fn release_agent(&mut self, agent: &AgentId, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if self.status.is_terminal() {
            return effects;
        }
        let released = self.release_holdings(agent, now, &mut effects);
        if !released.is_empty() {
            info!(
                session_id = %self.id,
                agent_id = %agent,
                released = released.len(),
                "Released tasks held by unreachable agent"
            );
            self.updated_at = now;
        }
        effects
    }

    // Task graph

    pub(crate) fn define_tasks(
        &mut self,
        specs: Vec<TaskSpec>,
        edges: &[(TaskId, TaskId)],
        now: DateTime<Utc>,
    ) -> Result<Effects, MeshError> {
        self.ensure_open()?;
        for spec in &specs {
            self.strategy.validate_spec(spec)?;
        }
        let ready = self.graph.extend(self.id, specs, edges, now)?;
        self.updated_at = now;

        let mut effects = Effects::default();
        for task_id in ready {
            effects.push(CoordinationEvent::TaskReady {
                session_id: self.id,
                task_id,
                ready_at: now,
            });
        }
        Ok(effects)
    }

    pub(crate) fn assign(
        &mut self,
        task_id: &TaskId,
        agent: &AgentRecord,
        now: DateTime<Utc>,
    ) -> Result<Effects, MeshError> {
        self.ensure_accepting_work()?;
        let task = self.ready_task(task_id)?;
        self.ensure_eligible(agent, task)?;
        self.strategy.validate_assignment(task, &agent.id)?;
        let cohort_target = if self.strategy.uses_cohort() {
            Some(self.strategy.cohort_target(1)?)
        } else {
            None
        };

        let task = self.graph.require_mut(task_id)?;
        match cohort_target {
            Some(target) => task.assign_cohort(vec![agent.id.clone()], target, now),
            None => task.assign(agent.id.clone(), now),
        }
        self.activate(now);

        let mut effects = Effects::default();
        effects.push(CoordinationEvent::TaskAssigned {
            session_id: self.id,
            task_id: task_id.clone(),
            agent_id: agent.id.clone(),
            assigned_at: now,
        });
        Ok(effects)
    }

    /// Hand one READY task to several agents at once.
    pub(crate) fn assign_cohort(
        &mut self,
        task_id: &TaskId,
        agents: &[AgentRecord],
        now: DateTime<Utc>,
    ) -> Result<Effects, MeshError> {
        self.ensure_accepting_work()?;
        if !self.strategy.uses_cohort() {
            return Err(MeshError::State(format!(
                "{} sessions assign one agent per task",
                self.pattern
            )));
        }
        if agents.is_empty() {
            return Err(MeshError::Validation("cohort must not be empty".to_string()));
        }

        let task = self.ready_task(task_id)?;
        let mut members = BTreeSet::new();
        for agent in agents {
            if !members.insert(agent.id.clone()) {
                return Err(MeshError::Validation(format!(
                    "agent {} listed twice in cohort",
                    agent.id
                )));
            }
            self.ensure_eligible(agent, task)?;
            self.strategy.validate_assignment(task, &agent.id)?;
        }
        let target = self.strategy.cohort_target(members.len())?;

        let members: Vec<AgentId> = members.into_iter().collect();
        let task = self.graph.require_mut(task_id)?;
        task.assign_cohort(members.clone(), target, now);
        self.activate(now);

        let mut effects = Effects::default();
        for agent_id in members {
            effects.push(CoordinationEvent::TaskAssigned {
                session_id: self.id,
                task_id: task_id.clone(),
                agent_id,
                assigned_at: now,
            });
        }
        Ok(effects)
    }

    /// Progress report from a holder. Accepted while PAUSED.
    pub(crate) fn report(
        &mut self,
        task_id: &TaskId,
        reporter: &AgentId,
        report: TaskReport,
        now: DateTime<Utc>,
    ) -> Result<Effects, MeshError> {
        self.ensure_open()?;
        if !matches!(
            report.status,
            TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed
        ) {
            return Err(MeshError::Validation(format!(
                "cannot report a task as {}",
                report.status
            )));
        }

        let task = self.graph.require_mut(task_id)?;
        if !task.holds(reporter) {
            return Err(MeshError::State(format!(
                "task {task_id} is {} and not held by {reporter}",
                task.status
            )));
        }
        if task.child_session.is_some() {
            return Err(MeshError::State(format!(
                "task {task_id} is resolved by its child session"
            )));
        }

        let cohort = !task.cohort.is_empty();
        task.touch(now);
        self.updated_at = now;
        let mut effects = Effects::default();

        match report.status {
            TaskStatus::Running => {
                if let Some(member) = task.cohort.get_mut(reporter) {
                    member.status = MemberStatus::Running;
                }
            }
            TaskStatus::Completed if cohort => {
                if let Some(member) = task.cohort.get_mut(reporter) {
                    member.status = MemberStatus::Reported;
                    member.result = report.result;
                    member.reported_at = Some(now);
                }
                self.settle_cohort(task_id, SettleCause::Report, now, &mut effects);
            }
            TaskStatus::Completed => {
                effects.follow_up(FollowUp::ClearFlag(reporter.clone()));
                self.finish_task(task_id, report.result, now, &mut effects);
            }
            _ => {
                let reason =
                    FailureReason::Reported(report.reason.unwrap_or_else(|| "unspecified".to_string()));
                if cohort {
                    if let Some(member) = task.cohort.get_mut(reporter) {
                        member.status = MemberStatus::Failed;
                    }
                    if task.pending_members() == 0 && task.reported_members() == 0 {
                        self.retry_or_fail(task_id, reason, now, &mut effects);
                    } else {
                        self.settle_cohort(task_id, SettleCause::Report, now, &mut effects);
                    }
                } else {
                    self.retry_or_fail(task_id, reason, now, &mut effects);
                }
            }
        }
        Ok(effects)
    }

    // AUCTION

    pub(crate) fn open_auction(&mut self, task_id: &TaskId, now: DateTime<Utc>) -> Result<DateTime<Utc>, MeshError> {
        self.ensure_accepting_work()?;
        self.ensure_pattern(CoordinationPattern::Auction)?;
        let task = self.ready_task(task_id)?;
        if task.auction.as_ref().is_some_and(|a| a.awarded_to.is_none()) {
            return Err(MeshError::State(format!(
                "auction for task {task_id} is already open"
            )));
        }

        let closes_at = deadline_after(now, self.policy.bid_window);
        let task = self.graph.require_mut(task_id)?;
        task.bids.clear();
        task.auction = Some(AuctionWindow {
            opened_at: now,
            closes_at,
            reopen_count: 0,
            awarded_to: None,
        });
        task.updated_at = now;
        self.activate(now);
        Ok(closes_at)
    }

    /// Submit or replace a bid while the window is open.
    pub(crate) fn submit_bid(
        &mut self,
        task_id: &TaskId,
        agent: &AgentRecord,
        cost: f64,
        eta: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), MeshError> {
        self.ensure_accepting_work()?;
        self.ensure_pattern(CoordinationPattern::Auction)?;
        if !cost.is_finite() || cost < 0.0 {
            return Err(MeshError::Validation(format!(
                "bid cost must be a non-negative number, got {cost}"
            )));
        }
        let task = self.ready_task(task_id)?;
        self.ensure_eligible(agent, task)?;
        match &task.auction {
            Some(window) if window.is_open(now) => {}
            Some(_) => {
                return Err(MeshError::State(format!(
                    "bid window for task {task_id} is closed"
                )))
            }
            None => {
                return Err(MeshError::State(format!(
                    "no auction is open for task {task_id}"
                )))
            }
        }

        let task = self.graph.require_mut(task_id)?;
        task.bids.retain(|bid| bid.agent_id != agent.id);
        task.bids.push(Bid {
            agent_id: agent.id.clone(),
            cost,
            eta,
            submitted_at: now,
        });
        task.updated_at = now;
        Ok(())
    }

    /// Award the task now instead of waiting for the window to lapse.
    pub(crate) fn close_auction(
        &mut self,
        task_id: &TaskId,
        eligible: &dyn Fn(&AgentId) -> bool,
        now: DateTime<Utc>,
    ) -> Result<Effects, MeshError> {
        self.ensure_accepting_work()?;
        self.ensure_pattern(CoordinationPattern::Auction)?;
        let task = self.ready_task(task_id)?;
        if !task.auction.as_ref().is_some_and(|a| a.awarded_to.is_none()) {
            return Err(MeshError::State(format!(
                "no auction is open for task {task_id}"
            )));
        }
        let mut effects = Effects::default();
        self.settle_auction(task_id, eligible, now, &mut effects);
        Ok(effects)
    }

    // HIERARCHICAL

    pub(crate) fn begin_delegation(
        &mut self,
        task_id: &TaskId,
        sub_coordinator: &AgentRecord,
        child: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Effects, MeshError> {
        self.ensure_accepting_work()?;
        self.ensure_pattern(CoordinationPattern::Hierarchical)?;
        let task = self.ready_task(task_id)?;
        self.ensure_eligible(sub_coordinator, task)?;
        self.strategy.validate_assignment(task, &sub_coordinator.id)?;

        let task = self.graph.require_mut(task_id)?;
        task.assign(sub_coordinator.id.clone(), now);
        task.child_session = Some(child);
        self.children.insert(child);
        self.activate(now);

        let mut effects = Effects::default();
        effects.push(CoordinationEvent::TaskAssigned {
            session_id: self.id,
            task_id: task_id.clone(),
            agent_id: sub_coordinator.id.clone(),
            assigned_at: now,
        });
        Ok(effects)
    }

    /// Apply a child session's terminal outcome to the delegated task.
    /// Stale outcomes (task requeued or re-delegated since) are ignored.
    pub(crate) fn resolve_delegation(
        &mut self,
        task_id: &TaskId,
        child: SessionId,
        outcome: ChildOutcome,
        now: DateTime<Utc>,
    ) -> Effects {
        let mut effects = Effects::default();
        if self.status.is_terminal() {
            return effects;
        }
        let current = self
            .graph
            .get(task_id)
            .is_some_and(|t| t.child_session == Some(child) && t.status.is_in_flight());
        if !current {
            debug!(session_id = %self.id, task_id = %task_id, child_session = %child, "Ignoring stale child outcome");
            return effects;
        }

        self.updated_at = now;
        match outcome {
            ChildOutcome::Completed(result) => self.finish_task(task_id, result, now, &mut effects),
            ChildOutcome::Failed(reason) => {
                self.retry_or_fail(task_id, FailureReason::ChildSession(reason), now, &mut effects)
            }
            ChildOutcome::Cancelled => self.retry_or_fail(
                task_id,
                FailureReason::ChildSession("cancelled".to_string()),
                now,
                &mut effects,
            ),
        }
        effects
    }

    // Shared state

    pub fn read_shared(&self, key: &str) -> Option<VersionedValue> {
        self.shared_state.read(key).cloned()
    }

    pub(crate) fn write_shared(
        &mut self,
        key: &str,
        value: Value,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, MeshError> {
        self.ensure_open()?;
        let version = self.shared_state.write(key, value, expected_version, now)?;
        self.updated_at = now;
        Ok(version)
    }

    // Timeouts

    /// Session deadline, auction windows and stalled tasks, in that order.
    pub(crate) fn sweep(&mut self, eligible: &dyn Fn(&AgentId) -> bool, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if self.status.is_terminal() {
            return effects;
        }
        if now > self.deadline {
            self.fail_session("session timed out (TIMEOUT)".to_string(), now, &mut effects);
            return effects;
        }
        if self.status == SessionStatus::Paused {
            return effects;
        }
        self.expire_auctions(eligible, now, &mut effects);
        self.expire_tasks(now, &mut effects);
        effects
    }

    fn expire_auctions(&mut self, eligible: &dyn Fn(&AgentId) -> bool, now: DateTime<Utc>, effects: &mut Effects) {
        let lapsed: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|t| {
                t.status == TaskStatus::Ready
                    && t
                        .auction
                        .as_ref()
                        .is_some_and(|a| a.awarded_to.is_none() && now > a.closes_at)
            })
            .map(|t| t.id.clone())
            .collect();
        for task_id in lapsed {
            self.settle_auction(&task_id, eligible, now, effects);
        }
    }

    fn expire_tasks(&mut self, now: DateTime<Utc>, effects: &mut Effects) {
        let timeout = chrono::Duration::from_std(self.policy.task_timeout).unwrap_or(chrono::Duration::MAX);
        let stalled: Vec<TaskId> = self
            .graph
            .tasks()
            .filter(|t| {
                t.status.is_in_flight()
                    && t.child_session.is_none()
                    && t.last_progress_at.is_some_and(|at| now - at > timeout)
            })
            .map(|t| t.id.clone())
            .collect();

        for task_id in stalled {
            let Some(task) = self.graph.get_mut(&task_id) else {
                continue;
            };
            effects.timed_out += 1;
            let reason = format!("task {task_id} in session {} timed out", self.id);

            if task.cohort.is_empty() {
                if let Some(agent) = task.assignee.clone() {
                    effects.follow_up(FollowUp::FlagDegraded { agent, reason });
                }
                self.retry_or_fail(&task_id, FailureReason::Timeout, now, effects);
                continue;
            }

            for (agent, member) in task.cohort.iter_mut() {
                if member.status.is_pending() {
                    member.status = MemberStatus::Failed;
                    effects.follow_up(FollowUp::FlagDegraded {
                        agent: agent.clone(),
                        reason: reason.clone(),
                    });
                }
            }
            if task.reported_members() == 0 {
                self.retry_or_fail(&task_id, FailureReason::Timeout, now, effects);
            } else {
                self.settle_cohort(&task_id, SettleCause::TimedOut, now, effects);
            }
        }
    }

    // Read models

    pub fn progress(&self) -> SessionProgress {
        let counts = self.graph.counts();
        SessionProgress {
            session_id: self.id,
            status: self.status,
            pattern: self.pattern,
            completed: counts.completed,
            total: counts.total,
            ratio: if counts.total == 0 {
                0.0
            } else {
                counts.completed as f64 / counts.total as f64
            },
            failed: counts.failed,
            cancelled: counts.cancelled,
            signal: self.strategy.progress_signal(&self.graph),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            coordinator_id: self.coordinator_id.clone(),
            pattern: self.pattern,
            goal: self.goal.clone(),
            status: self.status,
            participants: self
                .participants
                .iter()
                .filter(|(_, p)| p.left_at.is_none())
                .map(|(agent, _)| agent.clone())
                .collect(),
            tasks: self.graph.tasks().cloned().collect(),
            shared_state: self.shared_state.clone(),
            parent: self.parent.clone(),
            children: self.children.iter().copied().collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deadline: self.deadline,
            failure_reason: self.failure_reason.clone(),
        }
    }

    // Internals

    fn ensure_open(&self) -> Result<(), MeshError> {
        if self.status.is_terminal() {
            return Err(MeshError::State(format!(
                "session {} is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn ensure_accepting_work(&self) -> Result<(), MeshError> {
        self.ensure_open()?;
        if self.status == SessionStatus::Paused {
            return Err(MeshError::State(format!("session {} is paused", self.id)));
        }
        Ok(())
    }

    fn ensure_pattern(&self, pattern: CoordinationPattern) -> Result<(), MeshError> {
        if self.pattern != pattern {
            return Err(MeshError::State(format!(
                "session {} follows {}, not {pattern}",
                self.id, self.pattern
            )));
        }
        Ok(())
    }

    fn ensure_eligible(&self, agent: &AgentRecord, task: &Task) -> Result<(), MeshError> {
        if !self.is_participant(&agent.id) {
            return Err(MeshError::State(format!(
                "agent {} is not a participant of session {}",
                agent.id, self.id
            )));
        }
        if !agent.status.is_eligible() {
            return Err(MeshError::State(format!(
                "agent {} is {} and cannot take work",
                agent.id, agent.status
            )));
        }
        if !agent.has_capabilities(&task.required_capabilities) {
            return Err(MeshError::State(format!(
                "agent {} lacks capabilities required by task {}",
                agent.id, task.id
            )));
        }
        Ok(())
    }

    fn ready_task(&self, task_id: &TaskId) -> Result<&Task, MeshError> {
        let task = self.graph.require(task_id)?;
        if task.status != TaskStatus::Ready {
            return Err(MeshError::State(format!(
                "task {task_id} is {}, expected READY",
                task.status
            )));
        }
        Ok(task)
    }

    fn activate(&mut self, now: DateTime<Utc>) {
        if self.status == SessionStatus::Created {
            self.status = SessionStatus::Active;
        }
        self.updated_at = now;
    }

    fn release_holdings(&mut self, agent: &AgentId, now: DateTime<Utc>, effects: &mut Effects) -> Vec<TaskId> {
        let held = self.graph.held_by(agent);
        for task_id in &held {
            let Some(task) = self.graph.get_mut(task_id) else {
                continue;
            };
            if let Some(member) = task.cohort.get_mut(agent) {
                member.status = MemberStatus::Failed;
                task.updated_at = now;
                let abandoned = task.pending_members() == 0 && task.reported_members() == 0;
                if !abandoned {
                    self.settle_cohort(task_id, SettleCause::Released, now, effects);
                    continue;
                }
            } else if let Some(child) = task.child_session {
                effects.follow_up(FollowUp::CancelSession(child));
            }
            self.requeue_task(task_id, now, effects);
        }
        held
    }

    /// Re-evaluate a cohort task after a member's state changed.
    ///
    /// A quorum lost to departed members sends the task back to READY
    /// without spending a retry; one lost to the task timeout spends a retry.
    fn settle_cohort(&mut self, task_id: &TaskId, cause: SettleCause, now: DateTime<Utc>, effects: &mut Effects) {
        let Some(task) = self.graph.get(task_id) else {
            return;
        };
        if !task.status.is_in_flight() {
            return;
        }

        match self.strategy.on_task_complete(task) {
            Verdict::Pending => {}
            Verdict::Complete(result) => self.finish_task(task_id, result, now, effects),
            Verdict::Disagreement => {
                let target = task.cohort_target.unwrap_or(task.cohort.len());
                let rerun = self.strategy.allows_resolution_rounds()
                    && task.resolution_rounds < self.policy.max_retries
                    && task.reported_members() >= target;
                if !rerun {
                    self.fail_task(task_id, FailureReason::Disagreement, now, effects);
                    return;
                }
                if let Some(task) = self.graph.get_mut(task_id) {
                    task.reset_round(now);
                    info!(
                        session_id = %self.id,
                        task_id = %task_id,
                        round = task.resolution_rounds,
                        "No quorum, starting resolution round"
                    );
                }
            }
            Verdict::Unreachable => match cause {
                SettleCause::Report => self.fail_task(task_id, FailureReason::Unreachable, now, effects),
                SettleCause::Released => self.requeue_task(task_id, now, effects),
                SettleCause::TimedOut => self.retry_or_fail(task_id, FailureReason::Timeout, now, effects),
            },
        }
    }

    fn requeue_task(&mut self, task_id: &TaskId, now: DateTime<Utc>, effects: &mut Effects) {
        let Some(task) = self.graph.get_mut(task_id) else {
            return;
        };
        task.requeue(now);
        debug!(session_id = %self.id, task_id = %task_id, "Task requeued after losing its holders");
        effects.push(CoordinationEvent::TaskReady {
            session_id: self.id,
            task_id: task_id.clone(),
            ready_at: now,
        });
    }

    fn settle_auction(
        &mut self,
        task_id: &TaskId,
        eligible: &dyn Fn(&AgentId) -> bool,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let Some(task) = self.graph.get(task_id) else {
            return;
        };
        let valid: Vec<Bid> = task
            .bids
            .iter()
            .filter(|bid| self.is_participant(&bid.agent_id) && eligible(&bid.agent_id))
            .cloned()
            .collect();
        let winner = select_winner(&valid).map(|bid| bid.agent_id.clone());
        let reopen_count = task.auction.as_ref().map_or(0, |a| a.reopen_count);

        match winner {
            Some(winner) => {
                let Some(task) = self.graph.get_mut(task_id) else {
                    return;
                };
                if let Some(window) = task.auction.as_mut() {
                    window.awarded_to = Some(winner.clone());
                }
                task.assign(winner.clone(), now);
                self.activate(now);
                info!(session_id = %self.id, task_id = %task_id, agent_id = %winner, "Auction awarded");
                effects.push(CoordinationEvent::TaskAssigned {
                    session_id: self.id,
                    task_id: task_id.clone(),
                    agent_id: winner,
                    assigned_at: now,
                });
            }
            None if reopen_count < self.policy.max_retries => {
                let closes_at = deadline_after(now, self.policy.bid_window);
                let Some(task) = self.graph.get_mut(task_id) else {
                    return;
                };
                task.bids.clear();
                if let Some(window) = task.auction.as_mut() {
                    window.reopen_count += 1;
                    window.opened_at = now;
                    window.closes_at = closes_at;
                }
                task.updated_at = now;
                info!(session_id = %self.id, task_id = %task_id, "No valid bids, auction reopened");
            }
            None => self.fail_task(task_id, FailureReason::NoBids, now, effects),
        }
    }

    fn finish_task(&mut self, task_id: &TaskId, result: Option<Value>, now: DateTime<Utc>, effects: &mut Effects) {
        let Ok(ready) = self.graph.complete(task_id, result.clone(), now) else {
            return;
        };
        effects.push(CoordinationEvent::TaskCompleted {
            session_id: self.id,
            task_id: task_id.clone(),
            result,
            completed_at: now,
        });
        for ready_id in ready {
            effects.push(CoordinationEvent::TaskReady {
                session_id: self.id,
                task_id: ready_id,
                ready_at: now,
            });
        }
        self.check_completion(now, effects);
    }

    /// Requeue while retries remain, otherwise fail for good.
    fn retry_or_fail(&mut self, task_id: &TaskId, reason: FailureReason, now: DateTime<Utc>, effects: &mut Effects) {
        let Some(task) = self.graph.get_mut(task_id) else {
            return;
        };
        if task.retry_count >= self.policy.max_retries {
            self.fail_task(task_id, reason, now, effects);
            return;
        }

        task.retry_count += 1;
        task.failure_reason = Some(reason.clone());
        task.requeue(now);
        debug!(session_id = %self.id, task_id = %task_id, retry = task.retry_count, "Task requeued");
        effects.push(CoordinationEvent::TaskFailed {
            session_id: self.id,
            task_id: task_id.clone(),
            reason: reason.to_string(),
            retry_count: task.retry_count,
            will_retry: true,
            failed_at: now,
        });
        effects.push(CoordinationEvent::TaskReady {
            session_id: self.id,
            task_id: task_id.clone(),
            ready_at: now,
        });
    }

    fn fail_task(&mut self, task_id: &TaskId, reason: FailureReason, now: DateTime<Utc>, effects: &mut Effects) {
        let Some(task) = self.graph.get_mut(task_id) else {
            return;
        };
        if let Some(child) = task.child_session {
            effects.follow_up(FollowUp::CancelSession(child));
        }
        task.release_holders();
        task.failure_reason = Some(reason.clone());
        task.set_status(TaskStatus::Failed, now);
        info!(session_id = %self.id, task_id = %task_id, reason = %reason, "Task failed");
        effects.push(CoordinationEvent::TaskFailed {
            session_id: self.id,
            task_id: task_id.clone(),
            reason: reason.to_string(),
            retry_count: task.retry_count,
            will_retry: false,
            failed_at: now,
        });

        match self.strategy.failure_policy() {
            FailurePolicy::Isolate => {
                let cancelled = self.graph.cancel_dependents(task_id, now);
                if !cancelled.is_empty() {
                    debug!(session_id = %self.id, task_id = %task_id, cancelled = cancelled.len(), "Cancelled dependents of failed task");
                }
                self.check_completion(now, effects);
            }
            FailurePolicy::FailSession => {
                self.fail_session(format!("task {task_id} failed: {reason}"), now, effects);
            }
        }
    }

    fn check_completion(&mut self, now: DateTime<Utc>, effects: &mut Effects) {
        if self.status.is_terminal() || !self.strategy.completion_check(&self.graph) {
            return;
        }
        self.status = SessionStatus::Completed;
        self.updated_at = now;
        info!(session_id = %self.id, pattern = %self.pattern, "Session completed");
        effects.push(CoordinationEvent::SessionCompleted {
            session_id: self.id,
            completed_at: now,
        });
        self.cascade_to_children(effects);

        let results: Map<String, Value> = self
            .graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| (t.id.to_string(), t.result.clone().unwrap_or(Value::Null)))
            .collect();
        self.notify_parent(ChildOutcome::Completed(Some(Value::Object(results))), effects);
    }

    fn fail_session(&mut self, reason: String, now: DateTime<Utc>, effects: &mut Effects) {
        if self.status.is_terminal() {
            return;
        }
        let cancelled = self.graph.cancel_all(now);
        self.status = SessionStatus::Failed;
        self.failure_reason = Some(reason.clone());
        self.updated_at = now;
        info!(session_id = %self.id, reason = %reason, cancelled_tasks = cancelled.len(), "Session failed");
        effects.push(CoordinationEvent::SessionFailed {
            session_id: self.id,
            reason: reason.clone(),
            failed_at: now,
        });
        self.cascade_to_children(effects);
        self.notify_parent(ChildOutcome::Failed(reason), effects);
    }

    fn cascade_to_children(&self, effects: &mut Effects) {
        for child in &self.children {
            effects.follow_up(FollowUp::CancelSession(*child));
        }
    }

    fn notify_parent(&self, outcome: ChildOutcome, effects: &mut Effects) {
        if let Some(link) = &self.parent {
            effects.follow_up(FollowUp::PropagateToParent {
                link: link.clone(),
                child: self.id,
                outcome,
            });
        }
    }
}
