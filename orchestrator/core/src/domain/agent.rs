// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Record Aggregate
//!
//! The registry's unit of truth: one [`AgentRecord`] per worker agent, keyed by
//! [`AgentId`]. Records are created on registration, mutated by heartbeats and
//! the health monitor, and archived (never physically dropped) on
//! deregistration or long-term eviction.
//!
//! ## Liveness State Machine
//!
//! ```text
//! REGISTERING ─► ACTIVE ◄──► DEGRADED
//!                  │  ▲          │
//!                  ▼  │ heartbeat ▼
//!               UNHEALTHY ──────► OFFLINE
//!
//! any state ──deregister──► DEREGISTERED (terminal)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::domain::error::MeshError;

/// Caller-chosen, globally unique agent identifier.
///
/// Ordering is lexicographic; it is the final deterministic tie-break in
/// discovery ranking and auction award.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Build an id, rejecting blank input.
    pub fn parse(raw: impl Into<String>) -> Result<Self, MeshError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(MeshError::Validation("agent id must not be blank".to_string()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = MeshError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for AgentId {
    type Error = MeshError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Registering,
    Active,
    Degraded,
    Unhealthy,
    Offline,
    Deregistered,
}

impl AgentStatus {
    /// Ordinal along the liveness state machine; larger is worse.
    pub fn severity(self) -> u8 {
        match self {
            Self::Registering => 0,
            Self::Active => 1,
            Self::Degraded => 2,
            Self::Unhealthy => 3,
            Self::Offline => 4,
            Self::Deregistered => 5,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Statuses the health monitor re-evaluates on every sweep.
    pub fn is_monitored(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    pub fn is_discoverable(self, include_degraded: bool) -> bool {
        match self {
            Self::Active => true,
            Self::Degraded => include_degraded,
            _ => false,
        }
    }

    /// Whether the agent may receive new work.
    pub fn is_eligible(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Registering => "REGISTERING",
            Self::Active => "ACTIVE",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Offline => "OFFLINE",
            Self::Deregistered => "DEREGISTERED",
        };
        f.write_str(label)
    }
}

/// Registration payload supplied by a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    /// Protocol name → address (e.g. `"grpc" → "10.0.0.4:50051"`).
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AgentRegistration {
    pub fn new<I, S>(id: impl Into<String>, agent_type: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            endpoints: BTreeMap::new(),
            load: 0.0,
            region: None,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_endpoint(mut self, protocol: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(protocol.into(), address.into());
        self
    }
}

/// Registry-owned state for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub endpoints: BTreeMap<String, String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Utilisation in `[0, 1]`; headroom is `1 - load`.
    pub load: f64,
    pub region: Option<String>,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Degradation signal raised by coordination (e.g. a task timeout).
    /// While set, heartbeats cannot report the agent as ACTIVE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Validate a registration and build a fresh record in REGISTERING state.
    pub fn from_registration(registration: AgentRegistration, now: DateTime<Utc>) -> Result<Self, MeshError> {
        let id = AgentId::parse(registration.id)?;
        if registration.capabilities.iter().all(|c| c.trim().is_empty()) {
            return Err(MeshError::Validation(format!(
                "agent {id} must declare at least one capability"
            )));
        }
        validate_load(registration.load)?;

        Ok(Self {
            id,
            agent_type: registration.agent_type,
            capabilities: registration
                .capabilities
                .into_iter()
                .filter(|c| !c.trim().is_empty())
                .collect(),
            endpoints: registration.endpoints,
            status: AgentStatus::Registering,
            last_heartbeat: now,
            load: registration.load,
            region: registration.region,
            tags: registration.tags,
            metadata: registration.metadata,
            flagged: None,
            registered_at: now,
            status_changed_at: now,
        })
    }

    pub fn headroom(&self) -> f64 {
        1.0 - self.load
    }

    pub fn has_capabilities<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }

    /// Time since the last heartbeat, clamped at zero for clock skew.
    pub fn silence(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_heartbeat).max(chrono::Duration::zero())
    }

    /// Move to `status`, returning the previous one.
    pub fn transition(&mut self, status: AgentStatus, now: DateTime<Utc>) -> AgentStatus {
        let previous = self.status;
        if previous != status {
            self.status = status;
            self.status_changed_at = now;
        }
        previous
    }
}

pub(crate) fn validate_load(load: f64) -> Result<(), MeshError> {
    if !load.is_finite() || !(0.0..=1.0).contains(&load) {
        return Err(MeshError::Validation(format!(
            "load must be within [0, 1], got {load}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_rejected() {
        assert!(matches!(AgentId::parse("   "), Err(MeshError::Validation(_))));
        assert_eq!(AgentId::parse("worker-1").unwrap().as_str(), "worker-1");
    }

    #[test]
    fn every_conversion_rejects_blank_ids() {
        assert!(matches!("".parse::<AgentId>(), Err(MeshError::Validation(_))));
        assert!(AgentId::try_from(" ".to_string()).is_err());
        assert!(serde_json::from_str::<AgentId>("\"  \"").is_err());

        let id: AgentId = serde_json::from_str("\"worker-1\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"worker-1\"");
        assert_eq!("worker-1".parse::<AgentId>().unwrap(), id);
    }

    #[test]
    fn empty_capabilities_are_rejected() {
        let registration = AgentRegistration::new("worker-1", "analyst", Vec::<String>::new());
        let result = AgentRecord::from_registration(registration, Utc::now());
        assert!(matches!(result, Err(MeshError::Validation(_))));
    }

    #[test]
    fn out_of_range_load_is_rejected() {
        let registration = AgentRegistration::new("worker-1", "analyst", ["summarize"]).with_load(1.5);
        assert!(AgentRecord::from_registration(registration, Utc::now()).is_err());
    }

    #[test]
    fn worst_status_wins() {
        assert_eq!(AgentStatus::Active.worst(AgentStatus::Degraded), AgentStatus::Degraded);
        assert_eq!(AgentStatus::Unhealthy.worst(AgentStatus::Active), AgentStatus::Unhealthy);
    }
}
