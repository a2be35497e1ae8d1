// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Registry
//!
//! Authoritative, explicitly owned store of [`AgentRecord`]s. Constructed once
//! at process start, shared by `Arc` with the health monitor, discovery engine
//! and coordination manager, and [`AgentRegistry::drain`]ed at shutdown.
//!
//! # Locking
//!
//! Each live record sits behind its own `parking_lot::Mutex` inside a
//! `DashMap`, so operations on distinct agents never contend. A record lock
//! is never acquired while a map guard is held: callers clone the `Arc` out
//! of the map first.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** register / heartbeat / deregister and liveness transitions

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::agent::{validate_load, AgentId, AgentRecord, AgentRegistration, AgentStatus};
use crate::domain::config::LivenessConfig;
use crate::domain::error::{ConflictError, MeshError};
use crate::domain::events::AgentLifecycleEvent;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::telemetry;

/// Result of evaluating one record against the liveness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    Unchanged,
    /// Crossed `heartbeat_timeout`: now UNHEALTHY.
    Lost,
    /// Crossed `heartbeat_timeout * offline_multiplier`: now OFFLINE.
    Offline,
    /// OFFLINE for longer than `archive_after`: moved to the archive.
    Archived,
}

pub struct AgentRegistry {
    live: DashMap<AgentId, Arc<Mutex<AgentRecord>>>,
    archive: DashMap<AgentId, Vec<AgentRecord>>,
    config: LivenessConfig,
    event_bus: Arc<EventBus>,
}

impl AgentRegistry {
    pub fn new(config: LivenessConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            live: DashMap::new(),
            archive: DashMap::new(),
            config,
            event_bus,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn register(&self, registration: AgentRegistration) -> Result<AgentRecord, MeshError> {
        self.register_at(registration, Utc::now())
    }

    /// Register an agent. The id must not belong to a live record; OFFLINE
    /// records stay live until archived.
    pub fn register_at(
        &self,
        registration: AgentRegistration,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, MeshError> {
        let mut record = AgentRecord::from_registration(registration, now)?;
        record.transition(AgentStatus::Active, now);
        let snapshot = record.clone();

        match self.live.entry(record.id.clone()) {
            Entry::Occupied(_) => {
                return Err(ConflictError::DuplicateId(record.id.to_string()).into());
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(record)));
            }
        }

        info!(
            agent_id = %snapshot.id,
            agent_type = %snapshot.agent_type,
            capabilities = snapshot.capabilities.len(),
            "Agent registered"
        );
        counter!(telemetry::AGENTS_REGISTERED).increment(1);
        gauge!(telemetry::LIVE_AGENTS).set(self.live.len() as f64);

        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentRegistered {
            agent_id: snapshot.id.clone(),
            agent_type: snapshot.agent_type.clone(),
            registered_at: now,
        });

        Ok(snapshot)
    }

    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        status_override: Option<AgentStatus>,
        load: Option<f64>,
    ) -> Result<AgentStatus, MeshError> {
        self.heartbeat_at(agent_id, status_override, load, Utc::now())
    }

    /// Record a heartbeat and return the resulting status.
    ///
    /// A self-reported `status_override` only takes effect when it is no
    /// better than the status the registry computes (DEGRADED while flagged,
    /// ACTIVE otherwise).
    pub fn heartbeat_at(
        &self,
        agent_id: &AgentId,
        status_override: Option<AgentStatus>,
        load: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<AgentStatus, MeshError> {
        if let Some(status) = status_override {
            if matches!(
                status,
                AgentStatus::Registering | AgentStatus::Offline | AgentStatus::Deregistered
            ) {
                return Err(MeshError::Validation(format!(
                    "status override {status} cannot be self-reported"
                )));
            }
        }
        if let Some(load) = load {
            validate_load(load)?;
        }

        let entry = self.entry(agent_id)?;
        let mut record = entry.lock();

        match record.status {
            AgentStatus::Deregistered => return Err(MeshError::agent_not_found(agent_id)),
            AgentStatus::Offline => {
                return Err(MeshError::State(format!(
                    "agent {agent_id} is OFFLINE and must register again once archived"
                )));
            }
            _ => {}
        }

        let silence = record.silence(now);
        if silence > self.offline_threshold() {
            record.transition(AgentStatus::Offline, now);
            drop(record);
            warn!(agent_id = %agent_id, silent_for_ms = silence.num_milliseconds(), "Late heartbeat past offline threshold");
            counter!(telemetry::LIVENESS_TRANSITIONS, "status" => "OFFLINE").increment(1);
            self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentOffline {
                agent_id: agent_id.clone(),
                silent_for_ms: silence.num_milliseconds(),
                evicted_at: now,
            });
            return Err(MeshError::Timeout(format!(
                "heartbeat from {agent_id} arrived after {}ms of silence",
                silence.num_milliseconds()
            )));
        }

        record.last_heartbeat = now;
        if let Some(load) = load {
            record.load = load;
        }

        let computed = if record.flagged.is_some() {
            AgentStatus::Degraded
        } else {
            AgentStatus::Active
        };
        let next = match status_override {
            Some(reported) => computed.worst(reported),
            None => computed,
        };
        let previous = record.transition(next, now);
        drop(record);

        counter!(telemetry::HEARTBEATS).increment(1);
        if previous != next {
            counter!(telemetry::LIVENESS_TRANSITIONS, "status" => next.to_string()).increment(1);
        }

        if next == AgentStatus::Active
            && matches!(previous, AgentStatus::Unhealthy | AgentStatus::Degraded)
        {
            info!(agent_id = %agent_id, previous = %previous, "Agent recovered");
            self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentRecovered {
                agent_id: agent_id.clone(),
                previous_status: previous,
                recovered_at: now,
            });
        } else {
            debug!(agent_id = %agent_id, status = %next, "Heartbeat accepted");
        }

        Ok(next)
    }

    /// Deregister an agent. Repeated calls succeed without effect; unknown
    /// ids are `NotFound`.
    pub fn deregister(&self, agent_id: &AgentId) -> Result<(), MeshError> {
        let now = Utc::now();
        let Some((_, entry)) = self.live.remove(agent_id) else {
            if self.archive.contains_key(agent_id) {
                debug!(agent_id = %agent_id, "Deregister on archived agent is a no-op");
                return Ok(());
            }
            return Err(MeshError::agent_not_found(agent_id));
        };

        let snapshot = {
            let mut record = entry.lock();
            record.transition(AgentStatus::Deregistered, now);
            record.clone()
        };
        self.archive.entry(agent_id.clone()).or_default().push(snapshot);

        info!(agent_id = %agent_id, "Agent deregistered");
        counter!(telemetry::AGENTS_DEREGISTERED).increment(1);
        gauge!(telemetry::LIVE_AGENTS).set(self.live.len() as f64);
        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentDeregistered {
            agent_id: agent_id.clone(),
            deregistered_at: now,
        });
        Ok(())
    }

    /// Live record, or the most recent archived one.
    pub fn get(&self, agent_id: &AgentId) -> Result<AgentRecord, MeshError> {
        if let Some(entry) = self.live.get(agent_id).map(|e| Arc::clone(e.value())) {
            return Ok(entry.lock().clone());
        }
        self.archive
            .get(agent_id)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| MeshError::agent_not_found(agent_id))
    }

    /// Point-in-time copy of every live record.
    pub fn list(&self) -> Vec<AgentRecord> {
        self.live_entries()
            .into_iter()
            .map(|(_, entry)| entry.lock().clone())
            .collect()
    }

    /// Audit history for an id, oldest first.
    pub fn archived(&self, agent_id: &AgentId) -> Vec<AgentRecord> {
        self.archive
            .get(agent_id)
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn live_ids(&self) -> Vec<AgentId> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Whether the agent is live and may receive new work.
    pub fn is_eligible(&self, agent_id: &AgentId) -> bool {
        self.live
            .get(agent_id)
            .map(|e| Arc::clone(e.value()))
            .is_some_and(|entry| entry.lock().status.is_eligible())
    }

    /// Force the agent's computed status to DEGRADED until [`Self::clear_flag`].
    pub fn flag_degraded(&self, agent_id: &AgentId, reason: impl Into<String>) -> Result<(), MeshError> {
        let reason = reason.into();
        let entry = self.entry(agent_id)?;
        let previous = {
            let mut record = entry.lock();
            record.flagged = Some(reason.clone());
            if record.status == AgentStatus::Active {
                record.transition(AgentStatus::Degraded, Utc::now())
            } else {
                record.status
            }
        };
        if previous == AgentStatus::Active {
            counter!(telemetry::LIVENESS_TRANSITIONS, "status" => "DEGRADED").increment(1);
        }
        warn!(agent_id = %agent_id, reason = %reason, "Agent flagged as degraded");
        Ok(())
    }

    /// Drop the degradation flag. The next heartbeat restores ACTIVE.
    pub fn clear_flag(&self, agent_id: &AgentId) -> Result<(), MeshError> {
        let entry = self.entry(agent_id)?;
        let cleared = entry.lock().flagged.take();
        if cleared.is_some() {
            debug!(agent_id = %agent_id, "Degradation flag cleared");
        }
        Ok(())
    }

    /// Apply the two-tier liveness rule to one record.
    pub fn evaluate_liveness(
        &self,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<LivenessOutcome, MeshError> {
        let entry = self.entry(agent_id)?;
        let mut record = entry.lock();
        let silence = record.silence(now);
        let silent_for_ms = silence.num_milliseconds();
        let status = record.status;

        match status {
            AgentStatus::Active | AgentStatus::Degraded | AgentStatus::Unhealthy
                if silence > self.offline_threshold() =>
            {
                record.transition(AgentStatus::Offline, now);
                drop(record);
                warn!(agent_id = %agent_id, silent_for_ms, "Agent evicted to OFFLINE");
                counter!(telemetry::LIVENESS_TRANSITIONS, "status" => "OFFLINE").increment(1);
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentOffline {
                    agent_id: agent_id.clone(),
                    silent_for_ms,
                    evicted_at: now,
                });
                Ok(LivenessOutcome::Offline)
            }
            _ if status.is_monitored() && silence > heartbeat_timeout(&self.config) => {
                let previous = record.transition(AgentStatus::Unhealthy, now);
                drop(record);
                warn!(agent_id = %agent_id, silent_for_ms, "Agent lost: heartbeat timeout exceeded");
                counter!(telemetry::LIVENESS_TRANSITIONS, "status" => "UNHEALTHY").increment(1);
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentLost {
                    agent_id: agent_id.clone(),
                    previous_status: previous,
                    silent_for_ms,
                    lost_at: now,
                });
                Ok(LivenessOutcome::Lost)
            }
            AgentStatus::Offline if now - record.status_changed_at > archive_after(&self.config) => {
                let snapshot = record.clone();
                drop(record);
                Ok(self.archive_offline(agent_id, &entry, snapshot, now))
            }
            _ => Ok(LivenessOutcome::Unchanged),
        }
    }

    /// Deregister every live agent. Returns how many were drained.
    pub fn drain(&self) -> usize {
        let ids = self.live_ids();
        let drained = ids
            .iter()
            .filter(|id| self.deregister(id).is_ok())
            .count();
        info!(drained, "Agent registry drained");
        drained
    }

    fn archive_offline(
        &self,
        agent_id: &AgentId,
        entry: &Arc<Mutex<AgentRecord>>,
        snapshot: AgentRecord,
        now: DateTime<Utc>,
    ) -> LivenessOutcome {
        // Lost a race with deregister: it already archived the record.
        if self
            .live
            .remove_if(agent_id, |_, current| Arc::ptr_eq(current, entry))
            .is_none()
        {
            return LivenessOutcome::Unchanged;
        }

        self.archive.entry(agent_id.clone()).or_default().push(snapshot);
        info!(agent_id = %agent_id, "Offline agent archived");
        gauge!(telemetry::LIVE_AGENTS).set(self.live.len() as f64);
        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentArchived {
            agent_id: agent_id.clone(),
            archived_at: now,
        });
        LivenessOutcome::Archived
    }

    pub(crate) fn live_entries(&self) -> Vec<(AgentId, Arc<Mutex<AgentRecord>>)> {
        self.live
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn entry(&self, agent_id: &AgentId) -> Result<Arc<Mutex<AgentRecord>>, MeshError> {
        self.live
            .get(agent_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| MeshError::agent_not_found(agent_id))
    }

    fn offline_threshold(&self) -> chrono::Duration {
        to_chrono(self.config.offline_threshold())
    }
}

fn heartbeat_timeout(config: &LivenessConfig) -> chrono::Duration {
    to_chrono(config.heartbeat_timeout)
}

fn archive_after(config: &LivenessConfig) -> chrono::Duration {
    to_chrono(config.archive_after)
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
