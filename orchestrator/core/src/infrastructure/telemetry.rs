// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Telemetry bootstrap
//
// Log subscriber installation and metric descriptions. Metric values are
// recorded through the `metrics` facade at the call sites; installing an
// exporter is left to the embedding process.

use anyhow::Context;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use tracing_subscriber::EnvFilter;

use crate::domain::config::{LogFormat, LoggingConfig};

pub const AGENTS_REGISTERED: &str = "aegis_mesh_agents_registered_total";
pub const AGENTS_DEREGISTERED: &str = "aegis_mesh_agents_deregistered_total";
pub const HEARTBEATS: &str = "aegis_mesh_heartbeats_total";
pub const LIVENESS_TRANSITIONS: &str = "aegis_mesh_liveness_transitions_total";
pub const LIVE_AGENTS: &str = "aegis_mesh_live_agents";
pub const SWEEP_DURATION: &str = "aegis_mesh_health_sweep_duration_seconds";
pub const SWEEP_FAILURES: &str = "aegis_mesh_health_sweep_failures_total";
pub const DISCOVERY_QUERIES: &str = "aegis_mesh_discovery_queries_total";
pub const SESSIONS_CREATED: &str = "aegis_mesh_sessions_created_total";
pub const SESSIONS_TERMINATED: &str = "aegis_mesh_sessions_terminated_total";
pub const TASK_ASSIGNMENTS: &str = "aegis_mesh_task_assignments_total";
pub const TASK_RETRIES: &str = "aegis_mesh_task_retries_total";
pub const TASK_TIMEOUTS: &str = "aegis_mesh_task_timeouts_total";
pub const VERSION_CONFLICTS: &str = "aegis_mesh_shared_state_conflicts_total";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `Ok(false)` when a
/// subscriber was already installed (tests, embedding hosts).
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    Ok(installed)
}

/// Register descriptions for every metric the mesh records.
pub fn describe_metrics() {
    describe_counter!(AGENTS_REGISTERED, "Agents successfully registered");
    describe_counter!(AGENTS_DEREGISTERED, "Agents deregistered or drained");
    describe_counter!(HEARTBEATS, "Heartbeats accepted by the registry");
    describe_counter!(
        LIVENESS_TRANSITIONS,
        "Liveness status transitions, labelled by target status"
    );
    describe_gauge!(LIVE_AGENTS, "Agents currently held in the live registry");
    describe_histogram!(SWEEP_DURATION, Unit::Seconds, "Duration of one health sweep");
    describe_counter!(SWEEP_FAILURES, "Per-record failures skipped by the health sweep");
    describe_counter!(DISCOVERY_QUERIES, "Discovery queries answered");
    describe_counter!(SESSIONS_CREATED, "Coordination sessions created, by pattern");
    describe_counter!(
        SESSIONS_TERMINATED,
        "Coordination sessions reaching a terminal state, by outcome"
    );
    describe_counter!(TASK_ASSIGNMENTS, "Task assignments, by pattern");
    describe_counter!(TASK_RETRIES, "Task failures requeued for retry");
    describe_counter!(TASK_TIMEOUTS, "Tasks failed for lack of progress");
    describe_counter!(VERSION_CONFLICTS, "Shared-state writes rejected on a stale version");
}
