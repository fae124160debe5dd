//! End-to-end reconciliation scenarios.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{Duration, Utc};

use fleet_control::{
    ApplyOutcome, ApplyStatus, ControlConfig, ControlPlane, NodeStatus, RevisionOrigin,
    SweepCancellation,
};
use fleet_core::{
    AgentToken, AuditAction, Error, FailingAuditLog, MemoryAuditLog, MemoryBackend, NodeId,
    Payload, RevisionNumber, ServerId,
};

const OPERATOR: &str = "operator:alice";

fn rev(n: u64) -> RevisionNumber {
    RevisionNumber::new(n).unwrap()
}

async fn create_node(plane: &ControlPlane, payload: &'static str) -> NodeId {
    plane
        .tracker()
        .create_node(
            ServerId::new("srv-eu-1").unwrap(),
            &AgentToken::new("agent-token").unwrap(),
            Payload::from(payload),
            OPERATOR,
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn push_report_rollback_scenario() {
    let plane = ControlPlane::in_memory();
    let tracker = plane.tracker();

    let id = create_node(&plane, r#"{"inbounds":[]}"#).await;
    let node = tracker.get_node(&id).await.unwrap();
    assert_eq!(node.desired_revision, rev(1));
    assert_eq!(node.applied_revision, None);

    let node = tracker
        .push_desired_config(&id, Payload::from(r#"{"inbounds":[{"tag":"x"}]}"#), OPERATOR)
        .await
        .unwrap();
    assert_eq!(node.desired_revision, rev(2));
    assert_eq!(node.last_apply_status, ApplyStatus::Pending);

    let node = tracker
        .report_applied(&id, rev(2), ApplyOutcome::Success, None, "agent")
        .await
        .unwrap();
    assert_eq!(node.applied_revision, Some(rev(2)));
    assert_eq!(node.last_apply_status, ApplyStatus::Success);

    let node = tracker.rollback(&id, None, OPERATOR).await.unwrap();
    assert_eq!(node.desired_revision, rev(3));
    assert_eq!(node.last_apply_status, ApplyStatus::Pending);
    assert_eq!(node.applied_revision, Some(rev(2)));

    let copy = plane.revisions().get_revision(&id, rev(3)).await.unwrap();
    assert_eq!(copy.payload.as_bytes(), br#"{"inbounds":[]}"#);
    assert_eq!(
        copy.origin,
        RevisionOrigin::Rollback {
            rolled_back_from: rev(2),
            target: rev(1),
        }
    );
}

#[tokio::test]
async fn rollback_to_missing_revision_is_invalid() {
    let plane = ControlPlane::in_memory();
    let id = create_node(&plane, "a").await;
    for payload in ["b", "c"] {
        plane
            .tracker()
            .push_desired_config(&id, Payload::from(payload), OPERATOR)
            .await
            .unwrap();
    }

    let err = plane
        .tracker()
        .rollback(&id, Some(rev(99)), OPERATOR)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRevision { revision: 99, .. }));

    let revisions = plane.revisions().list_revisions(&id).await.unwrap();
    assert_eq!(revisions.len(), 3, "failed rollback must not store anything");
}

#[tokio::test]
async fn report_records_what_ran_even_after_newer_pushes() {
    let plane = ControlPlane::in_memory();
    let tracker = plane.tracker();
    let id = create_node(&plane, "v1").await;
    for payload in ["v2", "v3", "v4"] {
        tracker
            .push_desired_config(&id, Payload::from(payload), OPERATOR)
            .await
            .unwrap();
    }

    let node = tracker
        .report_applied(&id, rev(2), ApplyOutcome::Success, None, "agent")
        .await
        .unwrap();

    assert_eq!(node.desired_revision, rev(4));
    assert_eq!(node.applied_revision, Some(rev(2)));
    assert_eq!(node.last_apply_status, ApplyStatus::Success);
}

#[tokio::test]
async fn default_rollback_walks_back_through_desired_history() {
    let plane = ControlPlane::in_memory();
    let tracker = plane.tracker();
    let id = create_node(&plane, "one").await;
    tracker
        .push_desired_config(&id, Payload::from("two"), OPERATOR)
        .await
        .unwrap();

    // 2 -> copy of 1 as 3, then 3 -> copy of 2 as 4.
    tracker.rollback(&id, None, OPERATOR).await.unwrap();
    let node = tracker.rollback(&id, None, OPERATOR).await.unwrap();
    assert_eq!(node.desired_revision, rev(4));

    let fourth = plane.revisions().get_revision(&id, rev(4)).await.unwrap();
    assert_eq!(fourth.payload, Payload::from("two"));
}

#[tokio::test]
async fn check_offline_twice_is_idempotent() {
    let plane = ControlPlane::in_memory();
    let a = create_node(&plane, "a").await;
    let b = create_node(&plane, "b").await;
    let fresh = create_node(&plane, "c").await;

    let now = Utc::now();
    let liveness = plane.liveness();
    liveness
        .heartbeat_at(&a, "agent", now - Duration::seconds(600))
        .await
        .unwrap();
    liveness.heartbeat_at(&fresh, "agent", now).await.unwrap();

    let first = liveness
        .check_offline_at(120, now, &SweepCancellation::new())
        .await
        .unwrap();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(first.transitioned, expected);
    assert_eq!(first.scanned, 3);

    let second = liveness
        .check_offline_at(120, now, &SweepCancellation::new())
        .await
        .unwrap();
    assert!(second.transitioned.is_empty());

    assert_eq!(
        plane.tracker().get_node(&fresh).await.unwrap().status,
        NodeStatus::Online
    );
}

#[tokio::test]
async fn audit_failure_does_not_undo_the_push() {
    let plane = ControlPlane::in_memory_with_audit(Arc::new(FailingAuditLog));
    let id = create_node(&plane, "a").await;

    let node = plane
        .tracker()
        .push_desired_config(&id, Payload::from("b"), OPERATOR)
        .await
        .unwrap();

    assert_eq!(node.desired_revision, rev(2));
    assert_eq!(
        plane.tracker().get_node(&id).await.unwrap().desired_revision,
        rev(2)
    );
}

#[tokio::test]
async fn every_mutation_is_audited() {
    let audit = Arc::new(MemoryAuditLog::new());
    let plane = ControlPlane::in_memory_with_audit(audit.clone());
    let tracker = plane.tracker();

    let id = create_node(&plane, "a").await;
    tracker
        .push_desired_config(&id, Payload::from("b"), OPERATOR)
        .await
        .unwrap();
    tracker
        .report_applied(&id, rev(2), ApplyOutcome::Success, None, "agent")
        .await
        .unwrap();
    tracker.rollback(&id, None, OPERATOR).await.unwrap();
    plane.liveness().heartbeat(&id, "agent").await.unwrap();
    plane
        .liveness()
        .check_offline_at(0, Utc::now() + Duration::seconds(1), &SweepCancellation::new())
        .await
        .unwrap();

    let actions: Vec<AuditAction> = audit.records().iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::RevisionCreated,
            AuditAction::NodeCreated,
            AuditAction::RevisionCreated,
            AuditAction::DesiredConfigPushed,
            AuditAction::ConfigApplied,
            AuditAction::RevisionCreated,
            AuditAction::RollbackRequested,
            AuditAction::NodeHeartbeat,
            AuditAction::NodeMarkedOffline,
        ]
    );

    let push = &audit.find_by_action(AuditAction::DesiredConfigPushed)[0];
    assert_eq!(push.actor, OPERATOR);
    assert_eq!(push.entity_id, id.to_string());
    assert_eq!(push.summary["desired_revision"], 2);

    let revision = &audit.find_by_action(AuditAction::RevisionCreated)[1];
    assert_eq!(revision.entity_type.as_str(), "config_revision");
    assert_eq!(revision.entity_id, format!("{id}/2"));
}

#[tokio::test]
async fn small_batches_cover_every_node() {
    let plane = ControlPlane::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryAuditLog::new()),
        &ControlConfig {
            sweep_batch_size: 2,
            ..ControlConfig::default()
        },
    );
    for _ in 0..5 {
        create_node(&plane, "x").await;
    }

    let report = plane
        .liveness()
        .check_offline_at(60, Utc::now(), &SweepCancellation::new())
        .await
        .unwrap();
    assert_eq!(report.scanned, 5);
    assert_eq!(report.transitioned.len(), 5);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn get_revision_of_unknown_node_is_not_found() {
    let plane = ControlPlane::in_memory();
    let err = plane
        .revisions()
        .get_revision(&NodeId::generate(), rev(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { resource_type: "node", .. }));
}
