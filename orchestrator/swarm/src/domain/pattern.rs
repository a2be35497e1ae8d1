// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Pattern Strategies
//!
//! Each [`CoordinationPattern`] is bound to a [`PatternStrategy`] chosen once
//! when the session is created. The session aggregate performs the generic
//! checks (READY task, current participant, live agent, capabilities) and
//! defers the pattern-specific rules to the strategy.
//!
//! | Pattern | Holders | Completion | Failure policy |
//! |---------|---------|------------|----------------|
//! | SWARM | one claimant | all tasks terminal | isolate |
//! | PIPELINE | designated stage owner | all stages completed | fail session |
//! | HIERARCHICAL | sub-coordinator via child session | all tasks completed | fail session |
//! | CONSENSUS | cohort, quorum of matching votes | all tasks terminal | isolate |
//! | AUCTION | auction winner | all tasks terminal | isolate |
//! | COLLABORATIVE | cohort, completeness threshold | all tasks terminal | isolate |

use std::fmt;
use std::sync::Arc;

use aegis_mesh_core::domain::agent::AgentId;
use aegis_mesh_core::domain::coordination::{CoordinationPattern, TaskId, TaskStatus};
use aegis_mesh_core::domain::error::MeshError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::{Bid, MemberStatus, Task, TaskSpec};
use super::task_graph::TaskGraph;

/// What happens to the session once a task has failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// The task fails alone; its transitive dependents are cancelled.
    Isolate,
    /// The whole session fails and every open task is cancelled.
    FailSession,
}

/// Decision on a task after its holders reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Waiting for more reports.
    Pending,
    Complete(Option<Value>),
    /// Reported votes conflict: no quorum could form even if every lost
    /// member had voted with the largest group.
    Disagreement,
    /// Too few live members remain to reach the quorum or completeness
    /// threshold.
    Unreachable,
}

/// Pattern-specific progress indicator reported by `get_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressSignal {
    /// READY tasks waiting to be claimed.
    Claimable { ready: usize },
    /// First stage not yet completed.
    Stage { current: Option<TaskId> },
    /// Delegated tasks whose child session is still running.
    Delegations { open: usize },
    /// Best agreeing share across in-flight consensus tasks.
    Agreement { ratio: f64 },
    /// Bids on tasks whose auction window is still open.
    OpenBids { count: usize },
    /// Contributions gathered over contributions required, in-flight tasks.
    Completeness { ratio: f64 },
}

/// How partial COLLABORATIVE contributions are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// Array of contributions in agent id order.
    #[default]
    Collect,
    /// Shallow merge of object contributions in agent id order (later ids
    /// win on key clashes); non-object contributions are keyed by agent id.
    MergeObjects,
}

/// Strategy-level knobs resolved from the mesh configuration and the
/// session's own options.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSettings {
    /// Fraction of the cohort that agreeing votes must exceed.
    pub consensus_threshold: f64,
    /// Fixed quorum; overrides `consensus_threshold` when set.
    pub quorum: Option<usize>,
    pub completeness_threshold: f64,
    pub merge: MergeStrategy,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.5,
            quorum: None,
            completeness_threshold: 1.0,
            merge: MergeStrategy::Collect,
        }
    }
}

pub trait PatternStrategy: fmt::Debug + Send + Sync {
    fn pattern(&self) -> CoordinationPattern;

    /// Pattern rule for a task definition, checked before the plan is
    /// accepted.
    fn validate_spec(&self, spec: &TaskSpec) -> Result<(), MeshError> {
        let _ = spec;
        Ok(())
    }

    /// Pattern rule for handing `task` to `agent`.
    fn validate_assignment(&self, task: &Task, agent: &AgentId) -> Result<(), MeshError>;

    /// Whether tasks are held by a multi-member cohort.
    fn uses_cohort(&self) -> bool {
        false
    }

    /// Agreeing votes or contributions a cohort of `size` must produce.
    fn cohort_target(&self, size: usize) -> Result<usize, MeshError> {
        let _ = size;
        Err(MeshError::State(format!(
            "{} sessions assign one agent per task",
            self.pattern()
        )))
    }

    /// Re-evaluated after every report or holder change.
    fn on_task_complete(&self, task: &Task) -> Verdict {
        Verdict::Complete(task.result.clone())
    }

    /// Whether a disagreement may be retried with a resolution round.
    fn allows_resolution_rounds(&self) -> bool {
        false
    }

    fn completion_check(&self, graph: &TaskGraph) -> bool {
        graph.all_terminal()
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Isolate
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal;
}

/// Build the strategy bound to `pattern`.
pub fn strategy_for(pattern: CoordinationPattern, settings: &PatternSettings) -> Arc<dyn PatternStrategy> {
    match pattern {
        CoordinationPattern::Swarm => Arc::new(SwarmStrategy),
        CoordinationPattern::Pipeline => Arc::new(PipelineStrategy),
        CoordinationPattern::Hierarchical => Arc::new(HierarchicalStrategy),
        CoordinationPattern::Consensus => Arc::new(ConsensusStrategy {
            threshold: settings.consensus_threshold,
            quorum: settings.quorum,
        }),
        CoordinationPattern::Auction => Arc::new(AuctionStrategy),
        CoordinationPattern::Collaborative => Arc::new(CollaborativeStrategy {
            threshold: settings.completeness_threshold,
            merge: settings.merge,
        }),
    }
}

// SWARM

#[derive(Debug, Clone, Copy)]
pub struct SwarmStrategy;

impl PatternStrategy for SwarmStrategy {
    fn pattern(&self) -> CoordinationPattern {
        CoordinationPattern::Swarm
    }

    fn validate_assignment(&self, _task: &Task, _agent: &AgentId) -> Result<(), MeshError> {
        Ok(())
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal {
        ProgressSignal::Claimable {
            ready: graph.counts().ready,
        }
    }
}

// PIPELINE

#[derive(Debug, Clone, Copy)]
pub struct PipelineStrategy;

impl PatternStrategy for PipelineStrategy {
    fn pattern(&self) -> CoordinationPattern {
        CoordinationPattern::Pipeline
    }

    fn validate_spec(&self, spec: &TaskSpec) -> Result<(), MeshError> {
        match spec.designated_agent.as_deref().map(str::trim) {
            Some(owner) if !owner.is_empty() => Ok(()),
            _ => Err(MeshError::Validation(format!(
                "pipeline stage {} needs a designated agent",
                spec.id
            ))),
        }
    }

    fn validate_assignment(&self, task: &Task, agent: &AgentId) -> Result<(), MeshError> {
        match &task.designated_agent {
            Some(designated) if designated == agent => Ok(()),
            Some(designated) => Err(MeshError::State(format!(
                "stage {} is designated to {designated}, not {agent}",
                task.id
            ))),
            None => Err(MeshError::State(format!(
                "stage {} has no designated agent",
                task.id
            ))),
        }
    }

    fn completion_check(&self, graph: &TaskGraph) -> bool {
        graph.all_completed()
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailSession
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal {
        ProgressSignal::Stage {
            current: graph
                .tasks()
                .find(|t| t.status != TaskStatus::Completed)
                .map(|t| t.id.clone()),
        }
    }
}

// HIERARCHICAL

#[derive(Debug, Clone, Copy)]
pub struct HierarchicalStrategy;

impl PatternStrategy for HierarchicalStrategy {
    fn pattern(&self) -> CoordinationPattern {
        CoordinationPattern::Hierarchical
    }

    fn validate_assignment(&self, _task: &Task, _agent: &AgentId) -> Result<(), MeshError> {
        Ok(())
    }

    fn completion_check(&self, graph: &TaskGraph) -> bool {
        graph.all_completed()
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailSession
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal {
        ProgressSignal::Delegations {
            open: graph
                .tasks()
                .filter(|t| t.child_session.is_some() && t.status.is_in_flight())
                .count(),
        }
    }
}

// CONSENSUS

#[derive(Debug, Clone, Copy)]
pub struct ConsensusStrategy {
    pub threshold: f64,
    pub quorum: Option<usize>,
}

impl ConsensusStrategy {
    /// Matching votes needed from a cohort of `size`: the fixed quorum, or
    /// the smallest count strictly above `threshold * size` (capped at the
    /// cohort size, so a threshold of `1.0` means unanimity).
    pub fn quorum_for(&self, size: usize) -> usize {
        match self.quorum {
            Some(quorum) => quorum,
            None => ((size as f64 * self.threshold).floor() as usize + 1).min(size.max(1)),
        }
    }
}

/// Group reported votes by value, largest group first.
fn tally(task: &Task) -> Vec<(&Value, usize)> {
    let mut groups: Vec<(&Value, usize)> = Vec::new();
    for member in task.cohort.values() {
        if member.status != MemberStatus::Reported {
            continue;
        }
        let vote = member.result.as_ref().unwrap_or(&Value::Null);
        match groups.iter_mut().find(|(value, _)| *value == vote) {
            Some((_, count)) => *count += 1,
            None => groups.push((vote, 1)),
        }
    }
    groups.sort_by(|a, b| b.1.cmp(&a.1));
    groups
}

impl PatternStrategy for ConsensusStrategy {
    fn pattern(&self) -> CoordinationPattern {
        CoordinationPattern::Consensus
    }

    fn validate_assignment(&self, _task: &Task, _agent: &AgentId) -> Result<(), MeshError> {
        Ok(())
    }

    fn uses_cohort(&self) -> bool {
        true
    }

    fn cohort_target(&self, size: usize) -> Result<usize, MeshError> {
        let quorum = self.quorum_for(size);
        if quorum == 0 || quorum > size {
            return Err(MeshError::Validation(format!(
                "quorum of {quorum} cannot be reached by a cohort of {size}"
            )));
        }
        Ok(quorum)
    }

    fn on_task_complete(&self, task: &Task) -> Verdict {
        let target = task.cohort_target.unwrap_or(task.cohort.len());
        let groups = tally(task);
        let best = groups.first().map_or(0, |(_, count)| *count);

        if let Some((value, count)) = groups.first() {
            if *count >= target {
                return Verdict::Complete(Some((*value).clone()));
            }
        }
        if best + task.pending_members() + task.failed_members() < target {
            return Verdict::Disagreement;
        }
        if best + task.pending_members() < target {
            return Verdict::Unreachable;
        }
        Verdict::Pending
    }

    fn allows_resolution_rounds(&self) -> bool {
        true
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal {
        let ratios: Vec<f64> = graph
            .tasks()
            .filter(|t| t.status.is_in_flight() && !t.cohort.is_empty())
            .map(|t| {
                let best = tally(t).first().map_or(0, |(_, count)| *count);
                best as f64 / t.cohort.len() as f64
            })
            .collect();
        let ratio = if ratios.is_empty() {
            0.0
        } else {
            ratios.iter().sum::<f64>() / ratios.len() as f64
        };
        ProgressSignal::Agreement { ratio }
    }
}

// AUCTION

#[derive(Debug, Clone, Copy)]
pub struct AuctionStrategy;

/// Lowest cost, then earliest eta, then lowest agent id.
pub fn select_winner(bids: &[Bid]) -> Option<&Bid> {
    bids.iter().min_by(|a, b| {
        a.cost
            .total_cmp(&b.cost)
            .then_with(|| a.eta.cmp(&b.eta))
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    })
}

impl PatternStrategy for AuctionStrategy {
    fn pattern(&self) -> CoordinationPattern {
        CoordinationPattern::Auction
    }

    fn validate_assignment(&self, task: &Task, agent: &AgentId) -> Result<(), MeshError> {
        match task.auction.as_ref().and_then(|a| a.awarded_to.as_ref()) {
            Some(winner) if winner == agent => Ok(()),
            Some(winner) => Err(MeshError::State(format!(
                "task {} was awarded to {winner}",
                task.id
            ))),
            None => Err(MeshError::State(format!(
                "task {} must be awarded through an auction",
                task.id
            ))),
        }
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal {
        ProgressSignal::OpenBids {
            count: graph
                .tasks()
                .filter(|t| {
                    t.status == TaskStatus::Ready
                        && t.auction.as_ref().is_some_and(|a| a.awarded_to.is_none())
                })
                .map(|t| t.bids.len())
                .sum(),
        }
    }
}

// COLLABORATIVE

#[derive(Debug, Clone, Copy)]
pub struct CollaborativeStrategy {
    pub threshold: f64,
    pub merge: MergeStrategy,
}

impl CollaborativeStrategy {
    fn merge(&self, task: &Task) -> Value {
        let contributions = task
            .cohort
            .iter()
            .filter(|(_, m)| m.status == MemberStatus::Reported)
            .map(|(agent, m)| (agent, m.result.clone().unwrap_or(Value::Null)));

        match self.merge {
            MergeStrategy::Collect => Value::Array(contributions.map(|(_, v)| v).collect()),
            MergeStrategy::MergeObjects => {
                let mut merged = Map::new();
                for (agent, value) in contributions {
                    match value {
                        Value::Object(fields) => merged.extend(fields),
                        other => {
                            merged.insert(agent.to_string(), other);
                        }
                    }
                }
                Value::Object(merged)
            }
        }
    }
}

impl PatternStrategy for CollaborativeStrategy {
    fn pattern(&self) -> CoordinationPattern {
        CoordinationPattern::Collaborative
    }

    fn validate_assignment(&self, _task: &Task, _agent: &AgentId) -> Result<(), MeshError> {
        Ok(())
    }

    fn uses_cohort(&self) -> bool {
        true
    }

    fn cohort_target(&self, size: usize) -> Result<usize, MeshError> {
        if size == 0 {
            return Err(MeshError::Validation("cohort must not be empty".to_string()));
        }
        Ok(((size as f64 * self.threshold).ceil() as usize).clamp(1, size))
    }

    fn on_task_complete(&self, task: &Task) -> Verdict {
        let target = task.cohort_target.unwrap_or(task.cohort.len());
        let contributed = task.reported_members();
        if contributed >= target {
            return Verdict::Complete(Some(self.merge(task)));
        }
        if contributed + task.pending_members() < target {
            return Verdict::Unreachable;
        }
        Verdict::Pending
    }

    fn progress_signal(&self, graph: &TaskGraph) -> ProgressSignal {
        let (gathered, required) = graph
            .tasks()
            .filter(|t| t.status.is_in_flight())
            .filter_map(|t| t.cohort_target.map(|target| (t.reported_members(), target)))
            .fold((0, 0), |(g, r), (gathered, target)| (g + gathered, r + target));
        let ratio = if required == 0 {
            0.0
        } else {
            gathered as f64 / required as f64
        };
        ProgressSignal::Completeness { ratio }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_mesh_core::domain::coordination::SessionId;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use crate::domain::task::TaskSpec;

    fn cohort_task(members: &[&str], target: usize) -> Task {
        let mut task = Task::from_spec(
            TaskSpec::new("vote", ""),
            SessionId::new(),
            BTreeSet::new(),
            Utc::now(),
        )
        .unwrap();
        task.assign_cohort(members.iter().map(|m| AgentId::parse(*m).unwrap()).collect(), target, Utc::now());
        task
    }

    fn report(task: &mut Task, agent: &str, value: Value) {
        if let Some(member) = task.cohort.get_mut(&AgentId::parse(agent).unwrap()) {
            member.status = MemberStatus::Reported;
            member.result = Some(value);
        }
    }

    fn bid(agent: &str, cost: f64, eta_secs: u64) -> Bid {
        Bid {
            agent_id: AgentId::parse(agent).unwrap(),
            cost,
            eta: Duration::from_secs(eta_secs),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn default_quorum_is_a_strict_majority() {
        let strategy = ConsensusStrategy { threshold: 0.5, quorum: None };
        assert_eq!(strategy.quorum_for(5), 3);
        assert_eq!(strategy.quorum_for(4), 3);
        assert_eq!(strategy.quorum_for(1), 1);
        let unanimous = ConsensusStrategy { threshold: 1.0, quorum: None };
        assert_eq!(unanimous.quorum_for(4), 4);
        assert!(strategy.cohort_target(0).is_err());
    }

    #[test]
    fn consensus_completes_on_quorum() {
        let strategy = ConsensusStrategy { threshold: 0.5, quorum: Some(3) };
        let mut task = cohort_task(&["a", "b", "c", "d", "e"], 3);
        report(&mut task, "a", json!("yes"));
        report(&mut task, "b", json!("yes"));
        assert_eq!(strategy.on_task_complete(&task), Verdict::Pending);
        report(&mut task, "c", json!("yes"));
        assert_eq!(strategy.on_task_complete(&task), Verdict::Complete(Some(json!("yes"))));
    }

    #[test]
    fn consensus_detects_disagreement_early() {
        let strategy = ConsensusStrategy { threshold: 0.5, quorum: Some(3) };
        let mut task = cohort_task(&["a", "b", "c", "d", "e"], 3);
        report(&mut task, "a", json!(1));
        report(&mut task, "b", json!(1));
        report(&mut task, "c", json!(2));
        report(&mut task, "d", json!(2));
        assert_eq!(strategy.on_task_complete(&task), Verdict::Pending);
        report(&mut task, "e", json!(3));
        assert_eq!(strategy.on_task_complete(&task), Verdict::Disagreement);
    }

    #[test]
    fn lost_voters_make_quorum_unreachable_not_disagreed() {
        let strategy = ConsensusStrategy { threshold: 0.5, quorum: Some(3) };
        let mut task = cohort_task(&["a", "b", "c"], 3);
        report(&mut task, "a", json!("yes"));
        report(&mut task, "b", json!("yes"));
        if let Some(member) = task.cohort.get_mut(&AgentId::parse("c").unwrap()) {
            member.status = MemberStatus::Failed;
        }
        assert_eq!(strategy.on_task_complete(&task), Verdict::Unreachable);

        let mut split = cohort_task(&["a", "b", "c"], 3);
        report(&mut split, "a", json!("yes"));
        report(&mut split, "b", json!("no"));
        if let Some(member) = split.cohort.get_mut(&AgentId::parse("c").unwrap()) {
            member.status = MemberStatus::Failed;
        }
        assert_eq!(strategy.on_task_complete(&split), Verdict::Disagreement);
    }

    #[test]
    fn auction_tie_breaks_on_agent_id() {
        let bids = vec![bid("zeta", 10.0, 5), bid("alpha", 10.0, 5), bid("mid", 12.0, 1)];
        assert_eq!(select_winner(&bids).unwrap().agent_id, AgentId::parse("alpha").unwrap());

        let bids = vec![bid("zeta", 10.0, 4), bid("alpha", 10.0, 5)];
        assert_eq!(select_winner(&bids).unwrap().agent_id, AgentId::parse("zeta").unwrap());
        assert!(select_winner(&[]).is_none());
    }

    #[test]
    fn collaborative_merges_objects_in_agent_order() {
        let strategy = CollaborativeStrategy {
            threshold: 1.0,
            merge: MergeStrategy::MergeObjects,
        };
        let mut task = cohort_task(&["b", "a"], 2);
        report(&mut task, "b", json!({"summary": "b", "b_only": true}));
        assert_eq!(strategy.on_task_complete(&task), Verdict::Pending);
        report(&mut task, "a", json!({"summary": "a", "a_only": 1}));
        assert_eq!(
            strategy.on_task_complete(&task),
            Verdict::Complete(Some(json!({"summary": "b", "a_only": 1, "b_only": true})))
        );
    }

    #[test]
    fn collaborative_unreachable_when_contributors_fail() {
        let strategy = CollaborativeStrategy {
            threshold: 0.6,
            merge: MergeStrategy::Collect,
        };
        assert_eq!(strategy.cohort_target(3).unwrap(), 2);
        let mut task = cohort_task(&["a", "b", "c"], 2);
        report(&mut task, "a", json!("part-a"));
        for agent in ["b", "c"] {
            if let Some(member) = task.cohort.get_mut(&AgentId::parse(agent).unwrap()) {
                member.status = MemberStatus::Failed;
            }
        }
        assert_eq!(strategy.on_task_complete(&task), Verdict::Unreachable);
    }

    #[test]
    fn pipeline_enforces_designated_stage_owner() {
        let mut task = Task::from_spec(
            TaskSpec::new("stage-1", "").designated("owner"),
            SessionId::new(),
            BTreeSet::new(),
            Utc::now(),
        )
        .unwrap();
        task.status = TaskStatus::Ready;
        assert!(PipelineStrategy.validate_assignment(&task, &AgentId::parse("owner").unwrap()).is_ok());
        assert!(PipelineStrategy.validate_assignment(&task, &AgentId::parse("other").unwrap()).is_err());

        task.designated_agent = None;
        assert!(matches!(
            PipelineStrategy.validate_assignment(&task, &AgentId::parse("owner").unwrap()),
            Err(MeshError::State(_))
        ));
    }

    #[test]
    fn pipeline_stage_without_owner_is_rejected() {
        let strategy = PipelineStrategy;
        assert!(strategy.validate_spec(&TaskSpec::new("build", "").designated("w1")).is_ok());
        assert!(matches!(
            strategy.validate_spec(&TaskSpec::new("build", "")),
            Err(MeshError::Validation(_))
        ));
        assert!(matches!(
            strategy.validate_spec(&TaskSpec::new("build", "").designated("  ")),
            Err(MeshError::Validation(_))
        ));
        assert!(SwarmStrategy.validate_spec(&TaskSpec::new("build", "")).is_ok());
    }
}
