// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Timeout Sweeper - Background coordination housekeeping
//!
//! Runs [`CoordinationManager::sweep_timeouts`] on a fixed interval and
//! releases work held by agents the registry reports as lost, offline or
//! deregistered.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Independent scheduled worker over the coordination manager

use std::sync::Arc;
use std::time::Duration;

use aegis_mesh_core::domain::events::AgentLifecycleEvent;
use aegis_mesh_core::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError, EventReceiver};
use chrono::Utc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::manager::CoordinationManager;

pub struct TimeoutSweeper {
    manager: Arc<CoordinationManager>,
    event_bus: Arc<EventBus>,
    sweep_interval: Duration,
    shutdown_token: CancellationToken,
}

impl TimeoutSweeper {
    pub fn new(manager: Arc<CoordinationManager>, event_bus: Arc<EventBus>) -> Self {
        let sweep_interval = manager.config().timeout_sweep_interval;
        Self {
            manager,
            event_bus,
            sweep_interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the sweeper background task. The event subscription is taken
    /// before spawning so no liveness event published afterwards is missed.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let events = self.event_bus.subscribe();
        tokio::spawn(async move {
            self.run(events).await;
        })
    }

    async fn run(&self, mut events: EventReceiver) {
        info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            "Starting coordination timeout sweeper"
        );

        let mut tick = interval(self.sweep_interval);
        let mut listening = true;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.manager.sweep_timeouts(Utc::now());
                    if report.timed_out_tasks > 0 || !report.failed_sessions.is_empty() {
                        info!(
                            sessions = report.evaluated,
                            timed_out_tasks = report.timed_out_tasks,
                            failed_sessions = report.failed_sessions.len(),
                            "Timeout sweep applied"
                        );
                    }
                }
                event = events.recv(), if listening => match event {
                    Ok(DomainEvent::Agent(
                        AgentLifecycleEvent::AgentLost { agent_id, .. }
                        | AgentLifecycleEvent::AgentOffline { agent_id, .. }
                        | AgentLifecycleEvent::AgentDeregistered { agent_id, .. },
                    )) => {
                        debug!(agent_id = %agent_id, "Releasing work held by unreachable agent");
                        self.manager.release_agent(&agent_id, Utc::now());
                    }
                    Ok(_) => {}
                    Err(EventBusError::Lagged(skipped)) => {
                        warn!(skipped, "Timeout sweeper missed liveness events; next sweep reconciles timeouts only");
                    }
                    Err(_) => {
                        warn!("Event bus closed, continuing with periodic sweeps only");
                        listening = false;
                    }
                },
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping timeout sweeper");
                    break;
                }
            }
        }

        info!("Timeout sweeper background task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_mesh_core::application::registry::AgentRegistry;
    use aegis_mesh_core::domain::config::{CoordinationConfig, LivenessConfig};

    #[tokio::test]
    async fn stops_on_shutdown() {
        let bus = Arc::new(EventBus::new(16));
        let registry = Arc::new(AgentRegistry::new(LivenessConfig::default(), bus.clone()));
        let config = CoordinationConfig {
            timeout_sweep_interval: Duration::from_millis(10),
            ..CoordinationConfig::default()
        };
        let manager = Arc::new(CoordinationManager::new(registry, bus.clone(), config));
        let sweeper = Arc::new(TimeoutSweeper::new(manager, bus));
        let token = sweeper.shutdown_token();

        let handle = sweeper.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
