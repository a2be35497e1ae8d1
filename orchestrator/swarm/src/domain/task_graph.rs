// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Graph
//!
//! Per-session DAG of [`Task`]s. Every mutation is all-or-nothing and is
//! performed under the owning session's lock, so readiness propagation is
//! observed atomically with the status change that caused it.
//!
//! Tasks are kept in insertion order, and each batch is inserted in
//! topological order, so [`TaskGraph::tasks`] always yields a valid
//! execution order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use aegis_mesh_core::domain::agent::AgentId;
use aegis_mesh_core::domain::coordination::{SessionId, TaskId, TaskStatus};
use aegis_mesh_core::domain::error::{ConflictError, MeshError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::{Task, TaskSpec};

/// Task counts by coarse state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub total: usize,
    pub blocked: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl GraphCounts {
    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    dependents: BTreeMap<TaskId, BTreeSet<TaskId>>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of tasks plus extra `(before, after)` edges, where `after`
    /// depends on `before`.
    ///
    /// Dependencies may point at tasks already in the graph but edges may not
    /// add dependencies to them. Returns the ids that are READY on insertion.
    pub fn extend(
        &mut self,
        session_id: SessionId,
        specs: Vec<TaskSpec>,
        edges: &[(TaskId, TaskId)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, MeshError> {
        let mut batch: BTreeMap<TaskId, Task> = BTreeMap::new();
        for spec in specs {
            let dependencies = spec
                .dependencies
                .iter()
                .map(|d| TaskId::parse(d.as_str()))
                .collect::<Result<BTreeSet<_>, _>>()?;
            let task = Task::from_spec(spec, session_id, dependencies, now)?;
            if self.tasks.contains_key(&task.id) || batch.contains_key(&task.id) {
                return Err(ConflictError::DuplicateId(task.id.to_string()).into());
            }
            batch.insert(task.id.clone(), task);
        }

        for (before, after) in edges {
            let Some(task) = batch.get_mut(after) else {
                return Err(if self.tasks.contains_key(after) {
                    MeshError::Validation(format!(
                        "cannot add dependencies to existing task {after}"
                    ))
                } else {
                    MeshError::Validation(format!("edge targets unknown task {after}"))
                });
            };
            task.dependencies.insert(before.clone());
        }

        for task in batch.values() {
            for dependency in &task.dependencies {
                if batch.contains_key(dependency) {
                    continue;
                }
                match self.tasks.get(dependency) {
                    None => {
                        return Err(MeshError::Validation(format!(
                            "task {} depends on unknown task {dependency}",
                            task.id
                        )));
                    }
                    Some(existing)
                        if matches!(existing.status, TaskStatus::Failed | TaskStatus::Cancelled) =>
                    {
                        return Err(MeshError::State(format!(
                            "task {} depends on {dependency}, which is {}",
                            task.id, existing.status
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let ordered = topological_order(&batch)?;

        let mut ready = Vec::new();
        for id in ordered {
            let Some(mut task) = batch.remove(&id) else {
                continue;
            };
            let status = if self.dependencies_met(&task) {
                ready.push(id.clone());
                TaskStatus::Ready
            } else {
                TaskStatus::Blocked
            };
            task.set_status(status, now);
            for dependency in &task.dependencies {
                self.dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(id.clone());
            }
            self.order.push(id.clone());
            self.tasks.insert(id, task);
        }

        Ok(ready)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn require(&self, id: &TaskId) -> Result<&Task, MeshError> {
        self.tasks.get(id).ok_or_else(|| MeshError::task_not_found(id))
    }

    pub fn require_mut(&mut self, id: &TaskId) -> Result<&mut Task, MeshError> {
        self.tasks.get_mut(id).ok_or_else(|| MeshError::task_not_found(id))
    }

    /// Tasks in execution order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Mark a task COMPLETED and promote every dependent whose dependencies
    /// are now all complete. Returns the newly READY ids.
    pub fn complete(
        &mut self,
        id: &TaskId,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, MeshError> {
        let task = self.require_mut(id)?;
        task.result = result;
        task.failure_reason = None;
        task.set_status(TaskStatus::Completed, now);

        let dependents: Vec<TaskId> = self
            .dependents
            .get(id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();

        let mut ready = Vec::new();
        for dependent in dependents {
            let promote = self
                .tasks
                .get(&dependent)
                .is_some_and(|t| t.status == TaskStatus::Blocked && self.dependencies_met(t));
            if promote {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.set_status(TaskStatus::Ready, now);
                    ready.push(dependent);
                }
            }
        }
        Ok(ready)
    }

    /// Cancel every non-terminal task that transitively depends on `id`.
    pub fn cancel_dependents(&mut self, id: &TaskId, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut queue: VecDeque<TaskId> = VecDeque::from([id.clone()]);
        let mut seen = BTreeSet::new();

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.dependents.get(&current) else {
                continue;
            };
            for child in children.clone() {
                if !seen.insert(child.clone()) {
                    continue;
                }
                if let Some(task) = self.tasks.get_mut(&child) {
                    if !task.status.is_terminal() {
                        task.release_holders();
                        task.set_status(TaskStatus::Cancelled, now);
                        cancelled.push(child.clone());
                    }
                }
                queue.push_back(child);
            }
        }
        cancelled
    }

    /// Cancel every non-terminal task. Returns the cancelled ids.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get_mut(id) {
                if !task.status.is_terminal() {
                    task.release_holders();
                    task.set_status(TaskStatus::Cancelled, now);
                    cancelled.push(id.clone());
                }
            }
        }
        cancelled
    }

    /// Ids of in-flight tasks held by `agent`.
    pub fn held_by(&self, agent: &AgentId) -> Vec<TaskId> {
        self.tasks()
            .filter(|t| t.holds(agent))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn counts(&self) -> GraphCounts {
        let mut counts = GraphCounts {
            total: self.tasks.len(),
            ..GraphCounts::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending | TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Assigned | TaskStatus::Running => counts.in_flight += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn all_completed(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .values()
                .all(|t| t.status == TaskStatus::Completed)
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|d| {
            self.tasks
                .get(d)
                .is_some_and(|dep| dep.status == TaskStatus::Completed)
        })
    }
}

/// Kahn's algorithm over a batch; dependencies outside the batch are
/// already satisfied structurally.
fn topological_order(batch: &BTreeMap<TaskId, Task>) -> Result<Vec<TaskId>, MeshError> {
    let mut in_degree: BTreeMap<&TaskId, usize> = batch.keys().map(|id| (id, 0)).collect();
    let mut children: BTreeMap<&TaskId, Vec<&TaskId>> = BTreeMap::new();

    for (id, task) in batch {
        for dependency in &task.dependencies {
            if let Some((dep_id, _)) = batch.get_key_value(dependency) {
                *in_degree.entry(id).or_default() += 1;
                children.entry(dep_id).or_default().push(id);
            }
        }
    }

    let mut queue: VecDeque<&TaskId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut ordered = Vec::with_capacity(batch.len());

    while let Some(id) = queue.pop_front() {
        ordered.push(id.clone());
        for child in children.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if ordered.len() != batch.len() {
        let tasks = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(ConflictError::CyclicDependency { tasks }.into());
    }
    Ok(ordered)
}
