//! Liveness Monitor: heartbeats and the offline sweep.
//!
//! The sweep walks every node in ID order, in batches, against one
//! reference time captured when it starts. Each offline transition is an
//! independent compare-and-swap on the node record, so a partially
//! completed (or cancelled) sweep leaves consistent state behind.
//!
//! Each flip holds only that node's lock, so a heartbeat is either applied
//! before the staleness check or after the flip; both leave the node online.
//! The write is still a compare-and-swap: if it loses to a writer outside
//! this process the sweep re-reads and re-evaluates staleness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use fleet_core::audit::{AuditAction, AuditEmitter};
use fleet_core::lock::KeyedLock;
use fleet_core::observability::{node_span, sweep_span};
use fleet_core::{Error, NodeId, Result};

use crate::metrics::{time_sweep, ControlMetrics};
use crate::node::{EngineVersions, Node, NodeStatus, NodeStore};

/// Actor recorded for transitions made by the sweep.
pub const SWEEP_ACTOR: &str = "system:liveness";

/// Attempts made to flip one node before leaving it for the next sweep.
const SWEEP_CAS_ATTEMPTS: u32 = 3;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Nodes moved to offline, in ID order.
    pub transitioned: Vec<NodeId>,
    /// Nodes examined before the sweep finished or was cancelled.
    pub scanned: usize,
    /// True if the sweep stopped early.
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation for sweeps.
///
/// Clones share state. Sweeps check it between batches; the periodic task
/// also wakes on it.
#[derive(Debug, Clone, Default)]
pub struct SweepCancellation {
    state: Arc<CancelState>,
}

impl SweepCancellation {
    /// Creates an untriggered handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Converts a threshold in seconds into a signed duration.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the value does not fit.
pub fn threshold_from_secs(threshold_seconds: u64) -> Result<Duration> {
    i64::try_from(threshold_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "offline threshold of {threshold_seconds}s is out of range"
            ))
        })
}

/// Tracks agent contact and flags silent nodes.
#[derive(Clone)]
pub struct LivenessMonitor {
    nodes: NodeStore,
    locks: Arc<KeyedLock<NodeId>>,
    audit: AuditEmitter,
    metrics: ControlMetrics,
    batch_size: usize,
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl LivenessMonitor {
    pub(crate) fn new(
        nodes: NodeStore,
        locks: Arc<KeyedLock<NodeId>>,
        audit: AuditEmitter,
        batch_size: usize,
    ) -> Self {
        Self {
            nodes,
            locks,
            audit,
            metrics: ControlMetrics::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Records a heartbeat at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub async fn heartbeat(&self, node_id: &NodeId, actor: &str) -> Result<()> {
        self.heartbeat_at(node_id, actor, Utc::now()).await.map(|_| ())
    }

    /// Records a heartbeat that also reports the node's engine versions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub async fn heartbeat_with_engines(
        &self,
        node_id: &NodeId,
        actor: &str,
        engines: &EngineVersions,
    ) -> Result<Node> {
        self.record_heartbeat(node_id, actor, Utc::now(), engines).await
    }

    /// Records a heartbeat observed at `now`.
    ///
    /// Pending and offline nodes come online; disabled nodes only have
    /// `last_seen_at` updated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub async fn heartbeat_at(
        &self,
        node_id: &NodeId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        self.record_heartbeat(node_id, actor, now, &EngineVersions::new()).await
    }

    async fn record_heartbeat(
        &self,
        node_id: &NodeId,
        actor: &str,
        now: DateTime<Utc>,
        engines: &EngineVersions,
    ) -> Result<Node> {
        async {
            let _guard = self.locks.acquire(*node_id).await;
            let mut previous_status = None;
            let node = self
                .nodes
                .update(node_id, |node| {
                    previous_status = Some(node.status);
                    node.record_contact(now);
                    node.record_engine_versions(engines);
                    Ok(())
                })
                .await?;

            self.metrics.record_heartbeat();
            let previous = previous_status.unwrap_or(node.status);
            if previous != node.status {
                tracing::info!(from = %previous, to = %node.status, "node came online");
            } else {
                tracing::debug!("heartbeat");
            }

            let mut summary = json!({
                "previous_status": previous.as_str(),
                "status": node.status.as_str(),
                "last_seen_at": node.last_seen_at,
            });
            if !engines.is_empty() {
                summary["engine_versions"] = json!(engines);
            }
            self.audit
                .record(actor, AuditAction::NodeHeartbeat, node_id.to_string(), summary)
                .await;
            Ok::<_, Error>(node)
        }
        .instrument(node_span("heartbeat", node_id))
        .await
    }

    /// Marks every node silent for longer than `threshold_seconds` offline.
    ///
    /// Returns the IDs that were transitioned. A second call with no
    /// heartbeats in between returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the node listing or a record read fails.
    pub async fn check_offline(&self, threshold_seconds: u64) -> Result<Vec<NodeId>> {
        let report = self
            .check_offline_at(threshold_seconds, Utc::now(), &SweepCancellation::new())
            .await?;
        Ok(report.transitioned)
    }

    /// Runs one sweep against the reference time `now`.
    ///
    /// Cancellation is checked before each batch; transitions already made
    /// are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the node listing or a record read fails.
    pub async fn check_offline_at(
        &self,
        threshold_seconds: u64,
        now: DateTime<Utc>,
        cancel: &SweepCancellation,
    ) -> Result<SweepReport> {
        let threshold = threshold_from_secs(threshold_seconds)?;

        async {
            let _timer = time_sweep();
            let ids = self.nodes.list_ids().await?;
            let mut report = SweepReport::default();

            for batch in ids.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    tracing::info!(scanned = report.scanned, "offline sweep cancelled");
                    break;
                }

                let flipped = try_join_all(
                    batch
                        .iter()
                        .map(|id| self.mark_offline_if_stale(id, now, threshold)),
                )
                .await?;

                report.scanned += batch.len();
                report
                    .transitioned
                    .extend(flipped.into_iter().flatten());
            }

            self.metrics.record_marked_offline(report.transitioned.len());
            tracing::info!(
                scanned = report.scanned,
                transitioned = report.transitioned.len(),
                "offline sweep finished"
            );
            Ok::<_, Error>(report)
        }
        .instrument(sweep_span(threshold_seconds))
        .await
    }

    /// Flips one node to offline if it is still stale when written.
    ///
    /// Returns the ID if this call made the transition.
    async fn mark_offline_if_stale(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Option<NodeId>> {
        let _guard = self.locks.acquire(*node_id).await;
        for attempt in 1..=SWEEP_CAS_ATTEMPTS {
            let Some((node, version)) = self.nodes.load(node_id).await? else {
                return Ok(None);
            };
            if matches!(node.status, NodeStatus::Offline | NodeStatus::Disabled)
                || !node.is_stale(now, threshold)
            {
                return Ok(None);
            }

            let previous = node.status;
            let mut offline = node;
            offline.status = NodeStatus::Offline;
            offline.updated_at = Utc::now();

            if self.nodes.compare_and_swap(&offline, version).await? {
                tracing::info!(
                    node_id = %node_id,
                    from = %previous,
                    last_seen_at = ?offline.last_seen_at,
                    "node marked offline"
                );
                self.audit
                    .record(
                        SWEEP_ACTOR,
                        AuditAction::NodeMarkedOffline,
                        node_id.to_string(),
                        json!({
                            "previous_status": previous.as_str(),
                            "last_seen_at": offline.last_seen_at,
                            "threshold_seconds": threshold.num_seconds(),
                            "reference_time": now,
                        }),
                    )
                    .await;
                return Ok(Some(*node_id));
            }

            self.metrics.record_cas_conflict("node");
            tracing::debug!(node_id = %node_id, attempt, "offline flip lost CAS race; re-checking");
        }

        tracing::warn!(node_id = %node_id, "node kept changing during sweep; left for next sweep");
        Ok(None)
    }

    /// Runs the sweep every `interval` until `cancel` fires.
    ///
    /// A failing sweep is logged and retried on the next tick.
    pub fn spawn_periodic_sweep(
        self: Arc<Self>,
        interval: StdDuration,
        threshold_seconds: u64,
        cancel: SweepCancellation,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = interval.as_secs(),
                threshold_seconds,
                "periodic offline sweep started"
            );

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self
                    .check_offline_at(threshold_seconds, Utc::now(), &cancel)
                    .await
                {
                    tracing::error!(error = %e, "periodic offline sweep failed");
                }
            }

            tracing::info!("periodic offline sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlPlane;
    use fleet_core::{AgentToken, MemoryAuditLog, Payload, ServerId};

    async fn create(plane: &ControlPlane) -> NodeId {
        plane
            .tracker()
            .create_node(
                ServerId::new("srv").expect("server"),
                &AgentToken::new("tok").expect("token"),
                Payload::from("{}"),
                "operator",
            )
            .await
            .expect("create")
            .id
    }

    #[tokio::test]
    async fn heartbeat_brings_pending_node_online() {
        let plane = ControlPlane::in_memory();
        let id = create(&plane).await;

        plane.liveness().heartbeat(&id, "agent").await.expect("heartbeat");

        let node = plane.tracker().get_node(&id).await.expect("get");
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn late_heartbeat_does_not_rewind_last_seen() {
        let plane = ControlPlane::in_memory();
        let id = create(&plane).await;
        let fresher = Utc::now();
        let older = fresher - Duration::seconds(30);

        plane
            .liveness()
            .heartbeat_at(&id, "agent", fresher)
            .await
            .expect("fresh heartbeat");
        let node = plane
            .liveness()
            .heartbeat_at(&id, "agent", older)
            .await
            .expect("late heartbeat");

        assert_eq!(node.last_seen_at, Some(fresher));
        let flipped = plane
            .liveness()
            .check_offline_at(60, fresher + Duration::seconds(45), &SweepCancellation::new())
            .await
            .expect("sweep");
        assert!(flipped.transitioned.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_node_is_not_found() {
        let plane = ControlPlane::in_memory();
        let err = plane
            .liveness()
            .heartbeat(&NodeId::generate(), "agent")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn never_seen_nodes_are_marked_offline() {
        let plane = ControlPlane::in_memory();
        let id = create(&plane).await;

        let flipped = plane.liveness().check_offline(60).await.expect("sweep");
        assert_eq!(flipped, vec![id]);
    }

    #[tokio::test]
    async fn fresh_and_disabled_nodes_are_skipped() {
        let audit = Arc::new(MemoryAuditLog::new());
        let plane = ControlPlane::in_memory_with_audit(audit.clone());
        let fresh = create(&plane).await;
        let disabled = create(&plane).await;

        plane.liveness().heartbeat(&fresh, "agent").await.expect("heartbeat");
        plane
            .tracker()
            .set_disabled(&disabled, true, "operator")
            .await
            .expect("disable");

        let flipped = plane.liveness().check_offline(60).await.expect("sweep");
        assert!(flipped.is_empty());
        assert!(audit.find_by_action(AuditAction::NodeMarkedOffline).is_empty());
    }

    #[tokio::test]
    async fn disabled_node_stays_disabled_on_heartbeat() {
        let plane = ControlPlane::in_memory();
        let id = create(&plane).await;
        plane.tracker().set_disabled(&id, true, "operator").await.expect("disable");

        let node = plane
            .liveness()
            .heartbeat_at(&id, "agent", Utc::now())
            .await
            .expect("heartbeat");
        assert_eq!(node.status, NodeStatus::Disabled);
        assert!(node.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_before_first_batch() {
        let plane = ControlPlane::in_memory();
        create(&plane).await;

        let cancel = SweepCancellation::new();
        cancel.cancel();
        let report = plane
            .liveness()
            .check_offline_at(60, Utc::now(), &cancel)
            .await
            .expect("sweep");

        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);
        assert!(report.transitioned.is_empty());
    }

    #[tokio::test]
    async fn offline_node_comes_back_on_heartbeat() {
        let plane = ControlPlane::in_memory();
        let id = create(&plane).await;
        plane.liveness().check_offline(0).await.expect("sweep");
        assert_eq!(
            plane.tracker().get_node(&id).await.expect("get").status,
            NodeStatus::Offline
        );

        plane.liveness().heartbeat(&id, "agent").await.expect("heartbeat");
        assert_eq!(
            plane.tracker().get_node(&id).await.expect("get").status,
            NodeStatus::Online
        );
    }

    #[test]
    fn threshold_rejects_overflow() {
        assert!(threshold_from_secs(u64::MAX).is_err());
        assert_eq!(threshold_from_secs(90).expect("ok").num_seconds(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_stops_on_cancel() {
        let plane = ControlPlane::in_memory();
        let id = create(&plane).await;
        let cancel = SweepCancellation::new();

        let handle = Arc::clone(plane.liveness()).spawn_periodic_sweep(
            StdDuration::from_secs(30),
            0,
            cancel.clone(),
        );

        // First tick fires immediately.
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert_eq!(
            plane.tracker().get_node(&id).await.expect("get").status,
            NodeStatus::Offline
        );

        cancel.cancel();
        handle.await.expect("sweep task");
    }
}
