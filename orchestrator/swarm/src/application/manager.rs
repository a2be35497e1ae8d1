// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordination Manager
//!
//! Owns every [`CoordinationSession`] and is the single entry point for
//! session lifecycle, membership, task assignment, reporting, auctions,
//! delegation and shared state.
//!
//! # Locking
//!
//! Sessions live behind their own `parking_lot::Mutex` inside a `DashMap`, so
//! distinct sessions never contend. Registry lookups happen before the
//! session lock is taken, or under it (session → agent, never the reverse).
//! Effects that reach other sessions run only after the originating lock is
//! released, one session at a time.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Multi-pattern task coordination over the agent registry

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use aegis_mesh_core::application::registry::AgentRegistry;
use aegis_mesh_core::domain::agent::{AgentId, AgentRecord, AgentStatus};
use aegis_mesh_core::domain::config::CoordinationConfig;
use aegis_mesh_core::domain::coordination::{CoordinationPattern, SessionId, TaskId};
use aegis_mesh_core::domain::error::{ConflictError, MeshError};
use aegis_mesh_core::domain::events::CoordinationEvent;
use aegis_mesh_core::infrastructure::event_bus::EventBus;
use aegis_mesh_core::infrastructure::telemetry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::pattern::{MergeStrategy, PatternSettings};
use crate::domain::session::{
    CoordinationSession, Effects, FollowUp, ParentLink, SessionParams, SessionPolicy,
    SessionProgress, SessionSnapshot, TaskReport,
};
use crate::domain::shared_state::VersionedValue;
use crate::domain::task::{Task, TaskSpec};

/// Per-session overrides of the mesh-wide coordination defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Fixed CONSENSUS quorum; takes precedence over `consensus_threshold`.
    pub quorum: Option<usize>,
    pub consensus_threshold: Option<f64>,
    pub completeness_threshold: Option<f64>,
    pub merge: MergeStrategy,
    pub max_retries: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub task_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub bid_window: Option<Duration>,
}

/// Outcome of one timeout sweep across all sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutSweep {
    pub evaluated: usize,
    pub timed_out_tasks: usize,
    pub failed_sessions: Vec<SessionId>,
}

type SessionHandle = Arc<Mutex<CoordinationSession>>;

pub struct CoordinationManager {
    sessions: DashMap<SessionId, SessionHandle>,
    registry: Arc<AgentRegistry>,
    event_bus: Arc<EventBus>,
    config: CoordinationConfig,
}

impl CoordinationManager {
    pub fn new(registry: Arc<AgentRegistry>, event_bus: Arc<EventBus>, config: CoordinationConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    pub fn create_session(
        &self,
        coordinator_id: &AgentId,
        pattern: CoordinationPattern,
        goal: impl Into<String>,
        initial_plan: Vec<TaskSpec>,
    ) -> Result<SessionId, MeshError> {
        self.create_session_with_options(coordinator_id, pattern, goal, initial_plan, SessionOptions::default())
    }

    pub fn create_session_with_options(
        &self,
        coordinator_id: &AgentId,
        pattern: CoordinationPattern,
        goal: impl Into<String>,
        initial_plan: Vec<TaskSpec>,
        options: SessionOptions,
    ) -> Result<SessionId, MeshError> {
        let (session, effects) = self.build_session(
            coordinator_id,
            pattern,
            goal.into(),
            initial_plan,
            &options,
            None,
            Utc::now(),
        )?;
        let session_id = session.id();
        self.sessions.insert(session_id, Arc::new(Mutex::new(session)));

        counter!(telemetry::SESSIONS_CREATED, "pattern" => pattern.to_string()).increment(1);
        info!(session_id = %session_id, coordinator_id = %coordinator_id, pattern = %pattern, "Coordination session created");
        self.apply(effects);
        Ok(session_id)
    }

    pub fn start_session(&self, session_id: SessionId) -> Result<(), MeshError> {
        self.with_session(session_id, |session, now| session.start(now))?;
        info!(session_id = %session_id, "Session started");
        Ok(())
    }

    pub fn pause_session(&self, session_id: SessionId) -> Result<(), MeshError> {
        self.with_session(session_id, |session, now| session.pause(now))?;
        info!(session_id = %session_id, "Session paused");
        Ok(())
    }

    pub fn resume_session(&self, session_id: SessionId) -> Result<(), MeshError> {
        self.with_session(session_id, |session, now| session.resume(now))?;
        info!(session_id = %session_id, "Session resumed");
        Ok(())
    }

    /// Cancel the session and, transitively, its child sessions.
    /// Cancelling a terminal session is a no-op.
    pub fn cancel_session(&self, session_id: SessionId) -> Result<(), MeshError> {
        let effects = self.with_session(session_id, |session, now| Ok(session.cancel(now)))?;
        self.apply(effects);
        Ok(())
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub fn add_participant(&self, session_id: SessionId, agent_id: &AgentId) -> Result<(), MeshError> {
        let agent = self.registry.get(agent_id)?;
        if matches!(agent.status, AgentStatus::Offline | AgentStatus::Deregistered) {
            return Err(MeshError::State(format!(
                "agent {agent_id} is {} and cannot join a session",
                agent.status
            )));
        }
        self.mutate(session_id, |session, now| session.add_participant(agent.id.clone(), now))
    }

    /// Remove a participant; tasks it holds return to READY.
    pub fn remove_participant(&self, session_id: SessionId, agent_id: &AgentId) -> Result<(), MeshError> {
        self.mutate(session_id, |session, now| session.remove_participant(agent_id, now))
    }

    // ========================================================================
    // Task graph
    // ========================================================================

    /// Add tasks plus `(before, after)` dependency edges. All-or-nothing.
    pub fn define_task_graph(
        &self,
        session_id: SessionId,
        tasks: Vec<TaskSpec>,
        dependency_edges: &[(TaskId, TaskId)],
    ) -> Result<(), MeshError> {
        self.mutate(session_id, |session, now| {
            session.define_tasks(tasks, dependency_edges, now)
        })
    }

    pub fn assign_task(&self, session_id: SessionId, task_id: &TaskId, agent_id: &AgentId) -> Result<(), MeshError> {
        let agent = self.registry.get(agent_id)?;
        self.mutate(session_id, |session, now| session.assign(task_id, &agent, now))
    }

    /// Assign one task to several agents (CONSENSUS, COLLABORATIVE).
    pub fn assign_cohort(
        &self,
        session_id: SessionId,
        task_id: &TaskId,
        agent_ids: &[AgentId],
    ) -> Result<(), MeshError> {
        let agents = agent_ids
            .iter()
            .map(|id| self.registry.get(id))
            .collect::<Result<Vec<AgentRecord>, _>>()?;
        self.mutate(session_id, |session, now| session.assign_cohort(task_id, &agents, now))
    }

    pub fn report_task_status(
        &self,
        session_id: SessionId,
        task_id: &TaskId,
        agent_id: &AgentId,
        report: TaskReport,
    ) -> Result<(), MeshError> {
        self.mutate(session_id, |session, now| session.report(task_id, agent_id, report, now))
    }

    // ========================================================================
    // AUCTION
    // ========================================================================

    /// Open a bid window on a READY task. Returns when the window closes.
    pub fn open_auction(&self, session_id: SessionId, task_id: &TaskId) -> Result<DateTime<Utc>, MeshError> {
        let closes_at = self.with_session(session_id, |session, now| session.open_auction(task_id, now))?;
        debug!(session_id = %session_id, task_id = %task_id, %closes_at, "Auction opened");
        Ok(closes_at)
    }

    pub fn submit_bid(
        &self,
        session_id: SessionId,
        task_id: &TaskId,
        agent_id: &AgentId,
        cost: f64,
        eta: Duration,
    ) -> Result<(), MeshError> {
        let agent = self.registry.get(agent_id)?;
        self.with_session(session_id, |session, now| {
            session.submit_bid(task_id, &agent, cost, eta, now)
        })
    }

    /// Close the bid window now. Returns the winner, or `None` when the
    /// auction was reopened or failed for lack of bids.
    pub fn close_auction(&self, session_id: SessionId, task_id: &TaskId) -> Result<Option<AgentId>, MeshError> {
        let eligible = |agent: &AgentId| self.registry.is_eligible(agent);
        let effects = self.with_session(session_id, |session, now| {
            session.close_auction(task_id, &eligible, now)
        })?;
        let winner = effects.events.iter().find_map(|event| match event {
            CoordinationEvent::TaskAssigned { agent_id, .. } => Some(agent_id.clone()),
            _ => None,
        });
        self.apply(effects);
        Ok(winner)
    }

    // ========================================================================
    // HIERARCHICAL
    // ========================================================================

    /// Delegate a READY task to a sub-coordinator, which runs it as a nested
    /// session. The child's terminal state resolves the parent task.
    #[allow(clippy::too_many_arguments)]
    pub fn delegate_task(
        &self,
        session_id: SessionId,
        task_id: &TaskId,
        sub_coordinator: &AgentId,
        pattern: CoordinationPattern,
        goal: impl Into<String>,
        plan: Vec<TaskSpec>,
        options: SessionOptions,
    ) -> Result<SessionId, MeshError> {
        let now = Utc::now();
        let parent = self.session(session_id)?;
        let agent = self.registry.get(sub_coordinator)?;
        let link = ParentLink {
            session_id,
            task_id: task_id.clone(),
        };
        let (child, created) =
            self.build_session(sub_coordinator, pattern, goal.into(), plan, &options, Some(link), now)?;
        let child_id = child.id();

        // The child must be reachable before the parent task points at it.
        self.sessions.insert(child_id, Arc::new(Mutex::new(child)));
        let delegated = parent.lock().begin_delegation(task_id, &agent, child_id, now);
        match delegated {
            Ok(effects) => {
                counter!(telemetry::SESSIONS_CREATED, "pattern" => pattern.to_string()).increment(1);
                info!(
                    session_id = %session_id,
                    task_id = %task_id,
                    child_session = %child_id,
                    sub_coordinator = %sub_coordinator,
                    "Task delegated to child session"
                );
                self.apply(created);
                self.apply(effects);
                Ok(child_id)
            }
            Err(err) => {
                self.sessions.remove(&child_id);
                Err(err)
            }
        }
    }

    // ========================================================================
    // Shared state
    // ========================================================================

    pub fn read_shared(&self, session_id: SessionId, key: &str) -> Result<Option<VersionedValue>, MeshError> {
        self.with_session(session_id, |session, _| Ok(session.read_shared(key)))
    }

    /// Compare-and-swap write; returns the new version.
    pub fn write_shared(
        &self,
        session_id: SessionId,
        key: &str,
        value: Value,
        expected_version: u64,
    ) -> Result<u64, MeshError> {
        let result = self.with_session(session_id, |session, now| {
            session.write_shared(key, value, expected_version, now)
        });
        if let Err(MeshError::Conflict(ConflictError::VersionConflict { expected, actual, .. })) = &result {
            counter!(telemetry::VERSION_CONFLICTS).increment(1);
            debug!(session_id = %session_id, key, expected, actual, "Shared-state write rejected");
        }
        result
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_progress(&self, session_id: SessionId) -> Result<SessionProgress, MeshError> {
        self.with_session(session_id, |session, _| Ok(session.progress()))
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<SessionSnapshot, MeshError> {
        self.with_session(session_id, |session, _| Ok(session.snapshot()))
    }

    pub fn get_task(&self, session_id: SessionId, task_id: &TaskId) -> Result<Task, MeshError> {
        self.with_session(session_id, |session, _| session.graph().require(task_id).cloned())
    }

    // ========================================================================
    // Liveness integration
    // ========================================================================

    /// Free every task the agent holds across all open sessions.
    /// Returns the number of sessions that changed.
    pub fn release_agent(&self, agent_id: &AgentId, now: DateTime<Utc>) -> usize {
        let mut touched = 0;
        for session in self.handles() {
            let effects = session.lock().release_agent(agent_id, now);
            if !effects.is_empty() {
                touched += 1;
                self.apply(effects);
            }
        }
        if touched > 0 {
            info!(agent_id = %agent_id, sessions = touched, "Released work held by unreachable agent");
        }
        touched
    }

    /// Enforce session deadlines, auction windows and task timeouts as of `now`.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> TimeoutSweep {
        let eligible = |agent: &AgentId| self.registry.is_eligible(agent);
        let mut report = TimeoutSweep::default();

        for session in self.handles() {
            let effects = session.lock().sweep(&eligible, now);
            report.evaluated += 1;
            report.timed_out_tasks += effects.timed_out;
            report
                .failed_sessions
                .extend(effects.events.iter().filter_map(|event| match event {
                    CoordinationEvent::SessionFailed { session_id, .. } => Some(*session_id),
                    _ => None,
                }));
            self.apply(effects);
        }
        report
    }

    // ========================================================================
    // Internals
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn build_session(
        &self,
        coordinator_id: &AgentId,
        pattern: CoordinationPattern,
        goal: String,
        plan: Vec<TaskSpec>,
        options: &SessionOptions,
        parent: Option<ParentLink>,
        now: DateTime<Utc>,
    ) -> Result<(CoordinationSession, Effects), MeshError> {
        let coordinator = self.registry.get(coordinator_id)?;
        if coordinator.status != AgentStatus::Active {
            return Err(MeshError::State(format!(
                "coordinator {coordinator_id} is {}, expected ACTIVE",
                coordinator.status
            )));
        }
        let (settings, policy, session_timeout) = self.resolve(options)?;

        let mut session = CoordinationSession::new(
            SessionId::new(),
            SessionParams {
                coordinator_id: coordinator.id,
                pattern,
                goal,
                settings,
                policy,
                session_timeout,
                parent,
            },
            now,
        );

        let mut effects = Effects::default();
        effects.events.push(session.created_event());
        if !plan.is_empty() {
            effects.merge(session.define_tasks(plan, &[], now)?);
        }
        Ok((session, effects))
    }

    fn resolve(&self, options: &SessionOptions) -> Result<(PatternSettings, SessionPolicy, Duration), MeshError> {
        let consensus_threshold = options
            .consensus_threshold
            .unwrap_or(self.config.consensus_default_threshold);
        let completeness_threshold = options
            .completeness_threshold
            .unwrap_or(self.config.collaborative_completeness_threshold);
        check_fraction("consensus_threshold", consensus_threshold)?;
        check_fraction("completeness_threshold", completeness_threshold)?;
        if options.quorum == Some(0) {
            return Err(MeshError::Validation("quorum must be at least 1".to_string()));
        }

        let task_timeout = options.task_timeout.unwrap_or(self.config.task_timeout);
        let session_timeout = options.session_timeout.unwrap_or(self.config.session_timeout);
        let bid_window = options.bid_window.unwrap_or(self.config.auction_bid_window);
        for (field, value) in [
            ("task_timeout", task_timeout),
            ("session_timeout", session_timeout),
            ("bid_window", bid_window),
        ] {
            if value.is_zero() {
                return Err(MeshError::Validation(format!("{field} must be greater than zero")));
            }
        }

        Ok((
            PatternSettings {
                consensus_threshold,
                quorum: options.quorum,
                completeness_threshold,
                merge: options.merge,
            },
            SessionPolicy {
                max_retries: options.max_retries.unwrap_or(self.config.max_retries),
                task_timeout,
                bid_window,
            },
            session_timeout,
        ))
    }

    fn handle(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    fn session(&self, session_id: SessionId) -> Result<SessionHandle, MeshError> {
        self.handle(&session_id)
            .ok_or_else(|| MeshError::session_not_found(session_id))
    }

    /// Snapshot of every session handle, taken without holding map guards
    /// while the sessions themselves are locked.
    fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn with_session<T>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut CoordinationSession, DateTime<Utc>) -> Result<T, MeshError>,
    ) -> Result<T, MeshError> {
        let session = self.session(session_id)?;
        let mut guard = session.lock();
        f(&mut guard, Utc::now())
    }

    fn mutate(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut CoordinationSession, DateTime<Utc>) -> Result<Effects, MeshError>,
    ) -> Result<(), MeshError> {
        let effects = self.with_session(session_id, f)?;
        self.apply(effects);
        Ok(())
    }

    /// Publish events and run follow-ups, including any effects they produce.
    fn apply(&self, effects: Effects) {
        let mut pending = VecDeque::from([effects]);

        while let Some(effects) = pending.pop_front() {
            if effects.timed_out > 0 {
                counter!(telemetry::TASK_TIMEOUTS).increment(effects.timed_out as u64);
            }
            for event in effects.events {
                record_metrics(&event);
                self.event_bus.publish_coordination_event(event);
            }

            for follow_up in effects.follow_ups {
                let now = Utc::now();
                match follow_up {
                    FollowUp::PropagateToParent { link, child, outcome } => {
                        if let Some(parent) = self.handle(&link.session_id) {
                            let effects = parent.lock().resolve_delegation(&link.task_id, child, outcome, now);
                            pending.push_back(effects);
                        }
                    }
                    FollowUp::CancelSession(session_id) => {
                        if let Some(session) = self.handle(&session_id) {
                            let effects = session.lock().cancel(now);
                            pending.push_back(effects);
                        }
                    }
                    FollowUp::FlagDegraded { agent, reason } => {
                        if let Err(e) = self.registry.flag_degraded(&agent, reason) {
                            debug!(agent_id = %agent, error = %e, "Could not flag agent");
                        }
                    }
                    FollowUp::ClearFlag(agent) => {
                        if let Err(e) = self.registry.clear_flag(&agent) {
                            debug!(agent_id = %agent, error = %e, "Could not clear agent flag");
                        }
                    }
                }
            }
        }
    }
}

fn record_metrics(event: &CoordinationEvent) {
    match event {
        CoordinationEvent::TaskAssigned { .. } => {
            counter!(telemetry::TASK_ASSIGNMENTS).increment(1);
        }
        CoordinationEvent::TaskFailed { will_retry: true, .. } => {
            counter!(telemetry::TASK_RETRIES).increment(1);
        }
        CoordinationEvent::SessionCompleted { .. } => {
            counter!(telemetry::SESSIONS_TERMINATED, "outcome" => "completed").increment(1);
        }
        CoordinationEvent::SessionFailed { session_id, reason, .. } => {
            warn!(session_id = %session_id, reason = %reason, "Session failed");
            counter!(telemetry::SESSIONS_TERMINATED, "outcome" => "failed").increment(1);
        }
        CoordinationEvent::SessionCancelled { .. } => {
            counter!(telemetry::SESSIONS_TERMINATED, "outcome" => "cancelled").increment(1);
        }
        _ => {}
    }
}

fn check_fraction(field: &str, value: f64) -> Result<(), MeshError> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(MeshError::Validation(format!(
            "{field} must be within (0, 1], got {value}"
        )));
    }
    Ok(())
}
