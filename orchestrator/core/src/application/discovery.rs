// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Discovery Engine
//!
//! Read-only query layer over the [`AgentRegistry`]. Each query works on a
//! point-in-time copy of the candidate records, so readers hold a record lock
//! only long enough to clone it.
//!
//! Ranking is total and deterministic:
//! 1. more matched requested capabilities first (required + preferred)
//! 2. lower load first
//! 3. more recent heartbeat first
//! 4. agent id ascending
//!
//! An empty result is a valid answer; [`MeshError::Capacity`] is reserved for
//! malformed bounds.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::registry::{to_chrono, AgentRegistry};
use crate::domain::agent::AgentRecord;
use crate::domain::error::MeshError;
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagMatch {
    /// Every requested tag must be present.
    #[default]
    All,
    /// At least one requested tag must be present.
    Any,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Counted for ranking only; never filters.
    #[serde(default)]
    pub preferred_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub tag_match: TagMatch,
    /// Minimum `1 - load`, within `[0, 1]`.
    #[serde(default)]
    pub min_headroom: Option<f64>,
    /// Maximum results; must be non-zero when set.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_degraded: bool,
}

impl DiscoveryQuery {
    pub fn requiring<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_min_headroom(mut self, headroom: f64) -> Self {
        self.min_headroom = Some(headroom);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I, mode: TagMatch) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tag_match = mode;
        self
    }

    fn validate(&self) -> Result<(), MeshError> {
        if self.limit == Some(0) {
            return Err(MeshError::Capacity("limit must be greater than zero".to_string()));
        }
        if let Some(headroom) = self.min_headroom {
            if !(0.0..=1.0).contains(&headroom) {
                return Err(MeshError::Capacity(format!(
                    "min_headroom must be within [0, 1], got {headroom}"
                )));
            }
        }
        Ok(())
    }

    fn matches(&self, record: &AgentRecord) -> bool {
        if !record.status.is_discoverable(self.include_degraded) {
            return false;
        }
        if !record.has_capabilities(&self.required_capabilities) {
            return false;
        }
        if let Some(agent_type) = &self.agent_type {
            if &record.agent_type != agent_type {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if record.region.as_ref() != Some(region) {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let tagged = match self.tag_match {
                TagMatch::All => self.tags.is_subset(&record.tags),
                TagMatch::Any => !self.tags.is_disjoint(&record.tags),
            };
            if !tagged {
                return false;
            }
        }
        if let Some(min) = self.min_headroom {
            if record.headroom() < min {
                return false;
            }
        }
        true
    }

    fn matched_count(&self, record: &AgentRecord) -> usize {
        self.required_capabilities
            .union(&self.preferred_capabilities)
            .filter(|c| record.capabilities.contains(*c))
            .count()
    }
}

/// A ranked discovery hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMatch {
    pub record: AgentRecord,
    pub matched_capabilities: usize,
}

pub struct DiscoveryEngine {
    registry: Arc<AgentRegistry>,
}

impl DiscoveryEngine {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub fn discover(&self, query: &DiscoveryQuery) -> Result<Vec<DiscoveryMatch>, MeshError> {
        self.discover_at(query, Utc::now())
    }

    /// Answer `query` as of `now`. Agents silent for longer than the
    /// heartbeat timeout are skipped even before a sweep marks them lost.
    pub fn discover_at(
        &self,
        query: &DiscoveryQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<DiscoveryMatch>, MeshError> {
        query.validate()?;
        let heartbeat_timeout = to_chrono(self.registry.config().heartbeat_timeout);

        let mut hits: Vec<DiscoveryMatch> = self
            .registry
            .live_entries()
            .into_iter()
            .filter_map(|(_, entry)| {
                let record = entry.lock().clone();
                if record.silence(now) > heartbeat_timeout {
                    return None;
                }
                query.matches(&record).then(|| DiscoveryMatch {
                    matched_capabilities: query.matched_count(&record),
                    record,
                })
            })
            .collect();

        hits.sort_by(rank);
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }

        counter!(telemetry::DISCOVERY_QUERIES).increment(1);
        debug!(results = hits.len(), "Discovery query answered");
        Ok(hits)
    }
}

fn rank(a: &DiscoveryMatch, b: &DiscoveryMatch) -> Ordering {
    b.matched_capabilities
        .cmp(&a.matched_capabilities)
        .then_with(|| a.record.load.total_cmp(&b.record.load))
        .then_with(|| b.record.last_heartbeat.cmp(&a.record.last_heartbeat))
        .then_with(|| a.record.id.cmp(&b.record.id))
}
