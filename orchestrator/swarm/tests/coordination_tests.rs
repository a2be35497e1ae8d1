// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use std::time::Duration;

use aegis_mesh_core::application::registry::AgentRegistry;
use aegis_mesh_core::domain::agent::{AgentId, AgentRegistration, AgentStatus};
use aegis_mesh_core::domain::config::{CoordinationConfig, LivenessConfig};
use aegis_mesh_core::domain::coordination::{CoordinationPattern, SessionId, SessionStatus, TaskId, TaskStatus};
use aegis_mesh_core::domain::error::{ConflictError, MeshError};
use aegis_mesh_core::domain::events::CoordinationEvent;
use aegis_mesh_core::infrastructure::event_bus::{DomainEvent, EventBus};
use aegis_mesh_swarm::application::manager::{CoordinationManager, SessionOptions};
use aegis_mesh_swarm::application::timeout_sweeper::TimeoutSweeper;
use aegis_mesh_swarm::domain::pattern::{MergeStrategy, ProgressSignal};
use aegis_mesh_swarm::domain::session::TaskReport;
use aegis_mesh_swarm::domain::task::{FailureReason, TaskSpec};
use chrono::Utc;
use serde_json::json;

struct Mesh {
    registry: Arc<AgentRegistry>,
    manager: Arc<CoordinationManager>,
    bus: Arc<EventBus>,
}

fn mesh_with(config: CoordinationConfig, agents: &[&str]) -> Mesh {
    let bus = Arc::new(EventBus::new(512));
    let registry = Arc::new(AgentRegistry::new(LivenessConfig::default(), bus.clone()));
    for agent in agents {
        registry
            .register(AgentRegistration::new(*agent, "worker", ["run"]))
            .unwrap();
        registry.heartbeat(&id(agent), None, None).unwrap();
    }
    let manager = Arc::new(CoordinationManager::new(registry.clone(), bus.clone(), config));
    Mesh {
        registry,
        manager,
        bus,
    }
}

fn mesh(agents: &[&str]) -> Mesh {
    mesh_with(CoordinationConfig::default(), agents)
}

fn id(raw: &str) -> AgentId {
    AgentId::parse(raw).unwrap()
}

fn task(raw: &str) -> TaskId {
    TaskId::parse(raw).unwrap()
}

impl Mesh {
    fn session(&self, pattern: CoordinationPattern, plan: Vec<TaskSpec>, participants: &[&str]) -> SessionId {
        self.session_with(pattern, plan, participants, SessionOptions::default())
    }

    fn session_with(
        &self,
        pattern: CoordinationPattern,
        plan: Vec<TaskSpec>,
        participants: &[&str],
        options: SessionOptions,
    ) -> SessionId {
        let session = self
            .manager
            .create_session_with_options(&id("coord"), pattern, "goal", plan, options)
            .unwrap();
        for participant in participants {
            self.manager.add_participant(session, &id(participant)).unwrap();
        }
        session
    }

    fn status(&self, session: SessionId, task_id: &str) -> TaskStatus {
        self.manager.get_task(session, &task(task_id)).unwrap().status
    }

    fn complete(&self, session: SessionId, task_id: &str, agent: &str, result: serde_json::Value) {
        self.manager
            .report_task_status(session, &task(task_id), &id(agent), TaskReport::completed(result))
            .unwrap();
    }
}

#[test]
fn pipeline_completion_promotes_exactly_the_next_stage() {
    let mesh = mesh(&["coord", "a", "b", "c"]);
    let mut events = mesh.bus.subscribe();
    let session = mesh.session(CoordinationPattern::Pipeline, vec![], &["a", "b", "c"]);
    mesh.manager
        .define_task_graph(
            session,
            vec![
                TaskSpec::new("A", "extract").designated("a"),
                TaskSpec::new("B", "transform").designated("b"),
                TaskSpec::new("C", "load").designated("c"),
            ],
            &[(task("A"), task("B")), (task("B"), task("C"))],
        )
        .unwrap();
    assert_eq!(mesh.status(session, "A"), TaskStatus::Ready);
    assert_eq!(mesh.status(session, "B"), TaskStatus::Blocked);

    mesh.manager.assign_task(session, &task("A"), &id("a")).unwrap();
    mesh.complete(session, "A", "a", json!({"rows": 10}));

    assert_eq!(mesh.status(session, "B"), TaskStatus::Ready);
    assert_eq!(mesh.status(session, "C"), TaskStatus::Blocked);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::Coordination(event) = event {
            seen.push(event);
        }
    }
    let completed_at = seen
        .iter()
        .position(|e| matches!(e, CoordinationEvent::TaskCompleted { task_id, .. } if task_id.as_str() == "A"))
        .unwrap();
    assert!(matches!(
        &seen[completed_at + 1],
        CoordinationEvent::TaskReady { task_id, .. } if task_id.as_str() == "B"
    ));

    // Only the designated stage owner may take B.
    let err = mesh.manager.assign_task(session, &task("B"), &id("c")).unwrap_err();
    assert!(matches!(err, MeshError::State(_)));

    mesh.manager.assign_task(session, &task("B"), &id("b")).unwrap();
    mesh.complete(session, "B", "b", json!(null));
    mesh.manager.assign_task(session, &task("C"), &id("c")).unwrap();
    mesh.complete(session, "C", "c", json!("done"));

    let progress = mesh.manager.get_progress(session).unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!((progress.completed, progress.total), (3, 3));
    assert_eq!(progress.ratio, 1.0);
}

#[test]
fn pipeline_stage_failure_fails_the_session() {
    let mesh = mesh(&["coord", "a", "b"]);
    let options = SessionOptions {
        max_retries: Some(0),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Pipeline,
        vec![
            TaskSpec::new("A", "").designated("a"),
            TaskSpec::new("B", "").designated("b").depends_on(["A"]),
        ],
        &["a", "b"],
        options,
    );
    mesh.manager.assign_task(session, &task("A"), &id("a")).unwrap();
    mesh.manager
        .report_task_status(session, &task("A"), &id("a"), TaskReport::failed("disk full"))
        .unwrap();

    assert_eq!(mesh.status(session, "A"), TaskStatus::Failed);
    assert_eq!(mesh.status(session, "B"), TaskStatus::Cancelled);
    let snapshot = mesh.manager.get_session(session).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Failed);
    assert!(snapshot.failure_reason.unwrap().contains("disk full"));
}

#[test]
fn pipeline_stage_without_owner_is_rejected() {
    let mesh = mesh(&["coord", "a"]);
    let session = mesh.session(CoordinationPattern::Pipeline, vec![], &["a"]);

    let err = mesh
        .manager
        .define_task_graph(
            session,
            vec![TaskSpec::new("A", "").designated("a"), TaskSpec::new("B", "")],
            &[(task("A"), task("B"))],
        )
        .unwrap_err();
    assert!(matches!(err, MeshError::Validation(_)));
    assert_eq!(mesh.manager.get_progress(session).unwrap().total, 0);

    let err = mesh
        .manager
        .create_session_with_options(
            &id("coord"),
            CoordinationPattern::Pipeline,
            "goal",
            vec![TaskSpec::new("A", "")],
            SessionOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, MeshError::Validation(_)));
}

#[test]
fn cyclic_graph_persists_no_tasks() {
    let mesh = mesh(&["coord"]);
    let session = mesh.session(CoordinationPattern::Swarm, vec![], &[]);

    let err = mesh
        .manager
        .define_task_graph(
            session,
            vec![TaskSpec::new("A", ""), TaskSpec::new("B", ""), TaskSpec::new("C", "")],
            &[(task("A"), task("B")), (task("B"), task("C")), (task("C"), task("A"))],
        )
        .unwrap_err();

    assert!(matches!(
        err,
        MeshError::Conflict(ConflictError::CyclicDependency { .. })
    ));
    assert_eq!(mesh.manager.get_progress(session).unwrap().total, 0);
    assert!(matches!(
        mesh.manager.get_task(session, &task("A")),
        Err(MeshError::NotFound { .. })
    ));
}

#[test]
fn consensus_completes_on_three_matching_of_five() {
    let voters = ["v1", "v2", "v3", "v4", "v5"];
    let mesh = mesh(&["coord", "v1", "v2", "v3", "v4", "v5"]);
    let options = SessionOptions {
        quorum: Some(3),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Consensus,
        vec![TaskSpec::new("vote", "approve release?")],
        &voters,
        options,
    );
    let cohort: Vec<AgentId> = voters.iter().map(|v| id(v)).collect();
    mesh.manager.assign_cohort(session, &task("vote"), &cohort).unwrap();

    mesh.complete(session, "vote", "v1", json!("approve"));
    mesh.complete(session, "vote", "v4", json!("reject"));
    mesh.complete(session, "vote", "v2", json!("approve"));
    match mesh.manager.get_progress(session).unwrap().signal {
        ProgressSignal::Agreement { ratio } => assert!((ratio - 0.4).abs() < 1e-9),
        other => panic!("unexpected signal {other:?}"),
    }
    mesh.complete(session, "vote", "v3", json!("approve"));

    let vote = mesh.manager.get_task(session, &task("vote")).unwrap();
    assert_eq!(vote.status, TaskStatus::Completed);
    assert_eq!(vote.result, Some(json!("approve")));
    assert_eq!(
        mesh.manager.get_session(session).unwrap().status,
        SessionStatus::Completed
    );
}

#[test]
fn consensus_disagreement_fails_after_resolution_rounds() {
    let voters = ["v1", "v2", "v3", "v4", "v5"];
    let mesh = mesh(&["coord", "v1", "v2", "v3", "v4", "v5"]);
    let options = SessionOptions {
        quorum: Some(3),
        max_retries: Some(1),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Consensus,
        vec![TaskSpec::new("vote", "")],
        &voters,
        options,
    );
    let cohort: Vec<AgentId> = voters.iter().map(|v| id(v)).collect();
    mesh.manager.assign_cohort(session, &task("vote"), &cohort).unwrap();

    let ballots = [("v1", "a"), ("v2", "a"), ("v3", "b"), ("v4", "b"), ("v5", "c")];
    for (voter, ballot) in ballots {
        mesh.complete(session, "vote", voter, json!(ballot));
    }
    let vote = mesh.manager.get_task(session, &task("vote")).unwrap();
    assert!(vote.status.is_in_flight());
    assert_eq!(vote.resolution_rounds, 1);

    for (voter, ballot) in ballots {
        mesh.complete(session, "vote", voter, json!(ballot));
    }
    let vote = mesh.manager.get_task(session, &task("vote")).unwrap();
    assert_eq!(vote.status, TaskStatus::Failed);
    assert_eq!(vote.failure_reason, Some(FailureReason::Disagreement));
}

#[test]
fn auction_tie_goes_to_lowest_agent_id() {
    let mesh = mesh(&["coord", "bravo", "alpha"]);
    let session = mesh.session(
        CoordinationPattern::Auction,
        vec![TaskSpec::new("job", "")],
        &["bravo", "alpha"],
    );
    mesh.manager.open_auction(session, &task("job")).unwrap();
    for bidder in ["bravo", "alpha"] {
        mesh.manager
            .submit_bid(session, &task("job"), &id(bidder), 5.0, Duration::from_secs(60))
            .unwrap();
    }
    match mesh.manager.get_progress(session).unwrap().signal {
        ProgressSignal::OpenBids { count } => assert_eq!(count, 2),
        other => panic!("unexpected signal {other:?}"),
    }

    let winner = mesh.manager.close_auction(session, &task("job")).unwrap();
    assert_eq!(winner, Some(id("alpha")));
    let job = mesh.manager.get_task(session, &task("job")).unwrap();
    assert_eq!(job.status, TaskStatus::Assigned);
    assert_eq!(job.assignee, Some(id("alpha")));

    mesh.complete(session, "job", "alpha", json!(1));
    assert_eq!(
        mesh.manager.get_session(session).unwrap().status,
        SessionStatus::Completed
    );
}

#[test]
fn auction_without_bids_reopens_then_fails() {
    let mesh = mesh(&["coord", "w1"]);
    let options = SessionOptions {
        max_retries: Some(1),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Auction,
        vec![TaskSpec::new("job", "")],
        &["w1"],
        options,
    );
    mesh.manager.open_auction(session, &task("job")).unwrap();

    assert_eq!(mesh.manager.close_auction(session, &task("job")).unwrap(), None);
    let job = mesh.manager.get_task(session, &task("job")).unwrap();
    assert_eq!(job.status, TaskStatus::Ready);
    assert_eq!(job.auction.unwrap().reopen_count, 1);

    assert_eq!(mesh.manager.close_auction(session, &task("job")).unwrap(), None);
    let job = mesh.manager.get_task(session, &task("job")).unwrap();
    assert_eq!(job.status, TaskStatus::Failed);
    assert_eq!(job.failure_reason, Some(FailureReason::NoBids));
}

#[test]
fn lapsed_bid_window_is_awarded_by_sweep() {
    let mesh = mesh(&["coord", "w1", "w2"]);
    let options = SessionOptions {
        bid_window: Some(Duration::from_secs(1)),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Auction,
        vec![TaskSpec::new("job", "")],
        &["w1", "w2"],
        options,
    );
    mesh.manager.open_auction(session, &task("job")).unwrap();
    mesh.manager
        .submit_bid(session, &task("job"), &id("w2"), 3.0, Duration::from_secs(30))
        .unwrap();
    mesh.manager
        .submit_bid(session, &task("job"), &id("w1"), 3.0, Duration::from_secs(90))
        .unwrap();

    mesh.manager.sweep_timeouts(Utc::now() + chrono::Duration::seconds(5));
    let job = mesh.manager.get_task(session, &task("job")).unwrap();
    assert_eq!(job.assignee, Some(id("w2")));
}

#[test]
fn stale_shared_state_write_is_rejected() {
    let mesh = mesh(&["coord"]);
    let session = mesh.session(CoordinationPattern::Swarm, vec![], &[]);

    assert_eq!(mesh.manager.write_shared(session, "plan", json!("v1"), 0).unwrap(), 1);
    assert_eq!(mesh.manager.write_shared(session, "plan", json!("v2"), 1).unwrap(), 2);

    let err = mesh
        .manager
        .write_shared(session, "plan", json!("stale"), 1)
        .unwrap_err();
    assert!(matches!(
        err,
        MeshError::Conflict(ConflictError::VersionConflict { expected: 1, actual: 2, .. })
    ));
    let stored = mesh.manager.read_shared(session, "plan").unwrap().unwrap();
    assert_eq!(stored.value, json!("v2"));
    assert_eq!(stored.version, 2);
}

#[test]
fn swarm_failures_retry_then_cancel_dependents() {
    let mesh = mesh(&["coord", "w1", "w2"]);
    let options = SessionOptions {
        max_retries: Some(2),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Swarm,
        vec![
            TaskSpec::new("fetch", ""),
            TaskSpec::new("parse", "").depends_on(["fetch"]),
            TaskSpec::new("index", ""),
        ],
        &["w1", "w2"],
        options,
    );

    for attempt in 0..3 {
        assert_eq!(mesh.status(session, "fetch"), TaskStatus::Ready, "attempt {attempt}");
        mesh.manager.assign_task(session, &task("fetch"), &id("w1")).unwrap();
        mesh.manager
            .report_task_status(session, &task("fetch"), &id("w1"), TaskReport::failed("503"))
            .unwrap();
    }

    let fetch = mesh.manager.get_task(session, &task("fetch")).unwrap();
    assert_eq!(fetch.status, TaskStatus::Failed);
    assert_eq!(fetch.retry_count, 2);
    assert_eq!(mesh.status(session, "parse"), TaskStatus::Cancelled);
    assert_eq!(mesh.status(session, "index"), TaskStatus::Ready);
    assert_eq!(
        mesh.manager.get_session(session).unwrap().status,
        SessionStatus::Active
    );

    mesh.manager.assign_task(session, &task("index"), &id("w2")).unwrap();
    mesh.complete(session, "index", "w2", json!(true));
    let progress = mesh.manager.get_progress(session).unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!((progress.completed, progress.failed, progress.cancelled), (1, 1, 1));
}

#[test]
fn concurrent_claims_assign_a_task_once() {
    let agents: Vec<String> = (0..8).map(|i| format!("w{i}")).collect();
    let mut all: Vec<&str> = vec!["coord"];
    all.extend(agents.iter().map(String::as_str));
    let mesh = mesh(&all);
    let session = mesh.session(
        CoordinationPattern::Swarm,
        vec![TaskSpec::new("t", "")],
        &all[1..],
    );

    let handles: Vec<_> = agents
        .iter()
        .map(|agent| {
            let manager = mesh.manager.clone();
            let agent = id(agent);
            std::thread::spawn(move || manager.assign_task(session, &task("t"), &agent).is_ok())
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn collaborative_merges_contributions_in_agent_order() {
    let mesh = mesh(&["coord", "c2", "c1"]);
    let session = mesh.session(
        CoordinationPattern::Collaborative,
        vec![TaskSpec::new("report", "")],
        &["c1", "c2"],
    );
    mesh.manager
        .assign_cohort(session, &task("report"), &[id("c2"), id("c1")])
        .unwrap();

    mesh.complete(session, "report", "c2", json!("section two"));
    match mesh.manager.get_progress(session).unwrap().signal {
        ProgressSignal::Completeness { ratio } => assert!((ratio - 0.5).abs() < 1e-9),
        other => panic!("unexpected signal {other:?}"),
    }
    mesh.complete(session, "report", "c1", json!("section one"));

    let report = mesh.manager.get_task(session, &task("report")).unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.result, Some(json!(["section one", "section two"])));
}

#[test]
fn collaborative_fails_once_threshold_is_unreachable() {
    let mesh = mesh(&["coord", "c1", "c2", "c3"]);
    let options = SessionOptions {
        completeness_threshold: Some(0.6),
        merge: MergeStrategy::MergeObjects,
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Collaborative,
        vec![TaskSpec::new("report", "")],
        &["c1", "c2", "c3"],
        options,
    );
    mesh.manager
        .assign_cohort(session, &task("report"), &[id("c1"), id("c2"), id("c3")])
        .unwrap();

    mesh.complete(session, "report", "c1", json!({"intro": "..."}));
    mesh.manager
        .report_task_status(session, &task("report"), &id("c2"), TaskReport::failed("crashed"))
        .unwrap();
    assert!(mesh.status(session, "report").is_in_flight());

    mesh.manager
        .report_task_status(session, &task("report"), &id("c3"), TaskReport::failed("crashed"))
        .unwrap();
    let report = mesh.manager.get_task(session, &task("report")).unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failure_reason, Some(FailureReason::Unreachable));
    assert_eq!(report.retry_count, 0);
    assert_eq!(report.cohort[&id("c1")].result, Some(json!({"intro": "..."})));
}

#[test]
fn consensus_voter_leaving_requeues_the_vote() {
    let voters = ["v1", "v2", "v3"];
    let mesh = mesh(&["coord", "v1", "v2", "v3"]);
    let options = SessionOptions {
        quorum: Some(3),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Consensus,
        vec![TaskSpec::new("vote", "")],
        &voters,
        options,
    );
    let cohort: Vec<AgentId> = voters.iter().map(|v| id(v)).collect();
    mesh.manager.assign_cohort(session, &task("vote"), &cohort).unwrap();
    mesh.complete(session, "vote", "v1", json!("approve"));
    mesh.complete(session, "vote", "v2", json!("approve"));

    mesh.manager.remove_participant(session, &id("v3")).unwrap();

    let vote = mesh.manager.get_task(session, &task("vote")).unwrap();
    assert_eq!(vote.status, TaskStatus::Ready);
    assert_eq!(vote.retry_count, 0);
    assert_eq!(vote.failure_reason, None);
    assert!(vote.cohort.is_empty());
}

#[test]
fn consensus_voter_deregistering_requeues_the_vote() {
    let voters = ["v1", "v2", "v3"];
    let mesh = mesh(&["coord", "v1", "v2", "v3"]);
    let options = SessionOptions {
        quorum: Some(3),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Consensus,
        vec![TaskSpec::new("vote", "")],
        &voters,
        options,
    );
    let cohort: Vec<AgentId> = voters.iter().map(|v| id(v)).collect();
    mesh.manager.assign_cohort(session, &task("vote"), &cohort).unwrap();
    mesh.complete(session, "vote", "v1", json!("approve"));

    mesh.registry.deregister(&id("v2")).unwrap();
    mesh.manager.release_agent(&id("v2"), Utc::now());

    let vote = mesh.manager.get_task(session, &task("vote")).unwrap();
    assert_eq!(vote.status, TaskStatus::Ready);
    assert_eq!(vote.retry_count, 0);
    assert_ne!(vote.failure_reason, Some(FailureReason::Disagreement));
}

#[test]
fn consensus_timeout_after_partial_votes_spends_a_retry() {
    let voters = ["v1", "v2", "v3"];
    let mesh = mesh(&["coord", "v1", "v2", "v3"]);
    let options = SessionOptions {
        quorum: Some(3),
        max_retries: Some(1),
        task_timeout: Some(Duration::from_secs(1)),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Consensus,
        vec![TaskSpec::new("vote", "")],
        &voters,
        options,
    );
    let cohort: Vec<AgentId> = voters.iter().map(|v| id(v)).collect();
    mesh.manager.assign_cohort(session, &task("vote"), &cohort).unwrap();
    mesh.complete(session, "vote", "v1", json!("approve"));
    mesh.complete(session, "vote", "v2", json!("approve"));

    let report = mesh
        .manager
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(report.timed_out_tasks, 1);

    let vote = mesh.manager.get_task(session, &task("vote")).unwrap();
    assert_eq!(vote.status, TaskStatus::Ready);
    assert_eq!(vote.retry_count, 1);
    assert_eq!(vote.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(mesh.registry.get(&id("v3")).unwrap().status, AgentStatus::Degraded);
    assert_eq!(mesh.registry.get(&id("v1")).unwrap().status, AgentStatus::Active);
}

#[test]
fn collaborative_timeout_after_partial_contributions_spends_a_retry() {
    let mesh = mesh(&["coord", "c1", "c2"]);
    let options = SessionOptions {
        completeness_threshold: Some(1.0),
        max_retries: Some(1),
        task_timeout: Some(Duration::from_secs(1)),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Collaborative,
        vec![TaskSpec::new("report", "")],
        &["c1", "c2"],
        options,
    );
    mesh.manager
        .assign_cohort(session, &task("report"), &[id("c1"), id("c2")])
        .unwrap();
    mesh.complete(session, "report", "c1", json!("section one"));

    mesh.manager
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(5));
    let report = mesh.manager.get_task(session, &task("report")).unwrap();
    assert_eq!(report.status, TaskStatus::Ready);
    assert_eq!(report.retry_count, 1);
    assert_eq!(report.failure_reason, Some(FailureReason::Timeout));

    // The retry budget is spent on the second timeout.
    mesh.manager
        .assign_cohort(session, &task("report"), &[id("c1"), id("c2")])
        .unwrap();
    mesh.complete(session, "report", "c1", json!("section one"));
    mesh.manager
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(5));
    let report = mesh.manager.get_task(session, &task("report")).unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failure_reason, Some(FailureReason::Timeout));
}

#[test]
fn hierarchical_child_completion_resolves_parent_task() {
    let mesh = mesh(&["coord", "lead", "w1"]);
    let parent = mesh.session(
        CoordinationPattern::Hierarchical,
        vec![TaskSpec::new("research", "survey the field")],
        &["lead"],
    );
    let child = mesh
        .manager
        .delegate_task(
            parent,
            &task("research"),
            &id("lead"),
            CoordinationPattern::Swarm,
            "survey",
            vec![TaskSpec::new("papers", "")],
            SessionOptions::default(),
        )
        .unwrap();

    let child_snapshot = mesh.manager.get_session(child).unwrap();
    assert_eq!(child_snapshot.coordinator_id, id("lead"));
    assert_eq!(child_snapshot.parent.unwrap().session_id, parent);
    match mesh.manager.get_progress(parent).unwrap().signal {
        ProgressSignal::Delegations { open } => assert_eq!(open, 1),
        other => panic!("unexpected signal {other:?}"),
    }
    // The delegated task is resolved by the child, not by direct report.
    assert!(mesh
        .manager
        .report_task_status(parent, &task("research"), &id("lead"), TaskReport::completed(json!(1)))
        .is_err());

    mesh.manager.add_participant(child, &id("w1")).unwrap();
    mesh.manager.assign_task(child, &task("papers"), &id("w1")).unwrap();
    mesh.complete(child, "papers", "w1", json!(["p1", "p2"]));

    assert_eq!(
        mesh.manager.get_session(child).unwrap().status,
        SessionStatus::Completed
    );
    let research = mesh.manager.get_task(parent, &task("research")).unwrap();
    assert_eq!(research.status, TaskStatus::Completed);
    assert_eq!(research.result, Some(json!({"papers": ["p1", "p2"]})));
    assert_eq!(
        mesh.manager.get_session(parent).unwrap().status,
        SessionStatus::Completed
    );
}

#[test]
fn failed_child_session_requeues_parent_task() {
    let mesh = mesh(&["coord", "lead", "w1"]);
    let parent = mesh.session(
        CoordinationPattern::Hierarchical,
        vec![TaskSpec::new("build", "")],
        &["lead"],
    );
    let child = mesh
        .manager
        .delegate_task(
            parent,
            &task("build"),
            &id("lead"),
            CoordinationPattern::Pipeline,
            "build",
            vec![TaskSpec::new("compile", "").designated("w1")],
            SessionOptions {
                max_retries: Some(0),
                ..SessionOptions::default()
            },
        )
        .unwrap();
    mesh.manager.add_participant(child, &id("w1")).unwrap();
    mesh.manager.assign_task(child, &task("compile"), &id("w1")).unwrap();
    mesh.manager
        .report_task_status(child, &task("compile"), &id("w1"), TaskReport::failed("linker error"))
        .unwrap();

    assert_eq!(
        mesh.manager.get_session(child).unwrap().status,
        SessionStatus::Failed
    );
    let build = mesh.manager.get_task(parent, &task("build")).unwrap();
    assert_eq!(build.status, TaskStatus::Ready);
    assert_eq!(build.retry_count, 1);
    assert!(matches!(build.failure_reason, Some(FailureReason::ChildSession(_))));
}

#[test]
fn cancelling_parent_cascades_to_children() {
    let mesh = mesh(&["coord", "lead"]);
    let parent = mesh.session(
        CoordinationPattern::Hierarchical,
        vec![TaskSpec::new("research", "")],
        &["lead"],
    );
    let child = mesh
        .manager
        .delegate_task(
            parent,
            &task("research"),
            &id("lead"),
            CoordinationPattern::Swarm,
            "sub",
            vec![TaskSpec::new("papers", "")],
            SessionOptions::default(),
        )
        .unwrap();

    mesh.manager.cancel_session(parent).unwrap();
    assert_eq!(
        mesh.manager.get_session(child).unwrap().status,
        SessionStatus::Cancelled
    );
    assert_eq!(mesh.status(child, "papers"), TaskStatus::Cancelled);
    assert_eq!(mesh.status(parent, "research"), TaskStatus::Cancelled);
    mesh.manager.cancel_session(parent).unwrap();
}

#[test]
fn removing_participant_requeues_held_tasks() {
    let mesh = mesh(&["coord", "w1", "w2"]);
    let session = mesh.session(
        CoordinationPattern::Swarm,
        vec![TaskSpec::new("t1", "")],
        &["w1", "w2"],
    );
    mesh.manager.assign_task(session, &task("t1"), &id("w1")).unwrap();
    mesh.manager
        .report_task_status(session, &task("t1"), &id("w1"), TaskReport::running())
        .unwrap();
    assert_eq!(mesh.status(session, "t1"), TaskStatus::Running);

    mesh.manager.remove_participant(session, &id("w1")).unwrap();
    let t1 = mesh.manager.get_task(session, &task("t1")).unwrap();
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.assignee, None);
    assert_eq!(t1.retry_count, 0);

    assert!(mesh.manager.assign_task(session, &task("t1"), &id("w1")).is_err());
    mesh.manager.assign_task(session, &task("t1"), &id("w2")).unwrap();
}

#[test]
fn stalled_task_times_out_and_degrades_holder() {
    let mesh = mesh(&["coord", "w1"]);
    let options = SessionOptions {
        task_timeout: Some(Duration::from_secs(1)),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Swarm,
        vec![TaskSpec::new("t1", "")],
        &["w1"],
        options,
    );
    mesh.manager.assign_task(session, &task("t1"), &id("w1")).unwrap();

    let report = mesh
        .manager
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(report.timed_out_tasks, 1);

    let t1 = mesh.manager.get_task(session, &task("t1")).unwrap();
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(mesh.registry.get(&id("w1")).unwrap().status, AgentStatus::Degraded);
    assert_eq!(
        mesh.registry.heartbeat(&id("w1"), None, None).unwrap(),
        AgentStatus::Degraded
    );
}

#[test]
fn session_deadline_fails_session_and_cancels_tasks() {
    let mesh = mesh(&["coord"]);
    let options = SessionOptions {
        session_timeout: Some(Duration::from_secs(1)),
        ..SessionOptions::default()
    };
    let session = mesh.session_with(
        CoordinationPattern::Swarm,
        vec![TaskSpec::new("t1", "")],
        &[],
        options,
    );

    let report = mesh
        .manager
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(report.failed_sessions, vec![session]);
    assert_eq!(mesh.status(session, "t1"), TaskStatus::Cancelled);
}

#[tokio::test]
async fn sweeper_releases_tasks_of_deregistered_agents() {
    let mesh = mesh(&["coord", "w1"]);
    let session = mesh.session(
        CoordinationPattern::Swarm,
        vec![TaskSpec::new("t1", "")],
        &["w1"],
    );
    mesh.manager.assign_task(session, &task("t1"), &id("w1")).unwrap();

    let sweeper = Arc::new(TimeoutSweeper::new(mesh.manager.clone(), mesh.bus.clone()));
    let token = sweeper.shutdown_token();
    let handle = sweeper.start();

    mesh.registry.deregister(&id("w1")).unwrap();

    let mut released = false;
    for _ in 0..100 {
        if mesh.status(session, "t1") == TaskStatus::Ready {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    handle.await.unwrap();
    assert!(released);
}
