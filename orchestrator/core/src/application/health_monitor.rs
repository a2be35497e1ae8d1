// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health Monitor - Background liveness sweeper
//!
//! Periodically reconciles every live agent against the two-tier heartbeat
//! thresholds: silence beyond `heartbeat_timeout` marks the agent UNHEALTHY,
//! silence beyond `heartbeat_timeout * offline_multiplier` evicts it to
//! OFFLINE, and long-term OFFLINE records are archived.
//!
//! The sweep walks the registry in batches of `sweep_batch_size` and yields
//! between batches, taking each record lock only for the duration of its own
//! evaluation.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Independent scheduled worker over the agent registry

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::registry::{AgentRegistry, LivenessOutcome};
use crate::domain::agent::AgentId;
use crate::infrastructure::telemetry;

/// Outcome counts of a single sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub lost: Vec<AgentId>,
    pub offline: Vec<AgentId>,
    pub archived: Vec<AgentId>,
    /// Records that vanished or failed mid-sweep; re-evaluated next cycle.
    pub skipped: usize,
}

pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    shutdown_token: CancellationToken,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the sweeper background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let config = self.registry.config().clone();
        info!(
            heartbeat_timeout_ms = config.heartbeat_timeout.as_millis() as u64,
            offline_multiplier = config.offline_multiplier,
            sweep_interval_ms = config.sweep_interval.as_millis() as u64,
            "Starting health monitor background task"
        );

        let mut tick = interval(config.sweep_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.sweep_at(Utc::now()).await;
                    if report.lost.is_empty() && report.offline.is_empty() && report.archived.is_empty() {
                        debug!(evaluated = report.evaluated, "Health sweep completed");
                    } else {
                        info!(
                            evaluated = report.evaluated,
                            lost = report.lost.len(),
                            offline = report.offline.len(),
                            archived = report.archived.len(),
                            "Health sweep applied liveness transitions"
                        );
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping health monitor");
                    break;
                }
            }
        }

        info!("Health monitor background task stopped");
    }

    /// Run one sweep as of `now`.
    ///
    /// A failure on an individual record is logged and skipped; the record is
    /// picked up again on the next cycle.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let started = Instant::now();
        let batch_size = self.registry.config().sweep_batch_size.max(1);
        let ids = self.registry.live_ids();
        let mut report = SweepReport::default();

        for batch in ids.chunks(batch_size) {
            for agent_id in batch {
                match self.registry.evaluate_liveness(agent_id, now) {
                    Ok(outcome) => {
                        report.evaluated += 1;
                        match outcome {
                            LivenessOutcome::Unchanged => {}
                            LivenessOutcome::Lost => report.lost.push(agent_id.clone()),
                            LivenessOutcome::Offline => report.offline.push(agent_id.clone()),
                            LivenessOutcome::Archived => report.archived.push(agent_id.clone()),
                        }
                    }
                    Err(e) => {
                        report.skipped += 1;
                        counter!(telemetry::SWEEP_FAILURES).increment(1);
                        warn!(agent_id = %agent_id, error = %e, "Skipping record during health sweep");
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        histogram!(telemetry::SWEEP_DURATION).record(started.elapsed().as_secs_f64());
        report
    }
}
