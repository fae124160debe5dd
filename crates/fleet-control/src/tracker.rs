//! Reconciliation Tracker: desired/applied pointers and apply status.
//!
//! Every mutation runs under the node's entry in the shared [`KeyedLock`],
//! so pushes, rollbacks and reports on one node are serialized while other
//! nodes proceed independently. The node record write itself is a
//! compare-and-swap, so a writer that bypasses the lock table (another
//! process on the same storage) is detected, retried once, and then
//! reported as a conflict.
//!
//! ```text
//!     push / rollback
//!   ┌───────────────────────────────┐
//!   ▼                               │
//! pending ── report_applied ──► success | failed
//! ```

use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::json;

use fleet_core::audit::{AuditAction, AuditEmitter};
use fleet_core::lock::KeyedLock;
use fleet_core::{AgentToken, Error, NodeId, Payload, Result, RevisionNumber, ServerId};

use crate::metrics::ControlMetrics;
use crate::node::{ApplyOutcome, ApplyStatus, Node, NodeStatus, NodeStore};
use crate::revision::{RevisionOrigin, RevisionStore};

/// Owns each node's revision pointers and status.
#[derive(Clone)]
pub struct ReconciliationTracker {
    nodes: NodeStore,
    revisions: RevisionStore,
    locks: Arc<KeyedLock<NodeId>>,
    audit: AuditEmitter,
    metrics: ControlMetrics,
}

impl std::fmt::Debug for ReconciliationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationTracker").finish_non_exhaustive()
    }
}

impl ReconciliationTracker {
    pub(crate) fn new(
        nodes: NodeStore,
        revisions: RevisionStore,
        locks: Arc<KeyedLock<NodeId>>,
        audit: AuditEmitter,
    ) -> Self {
        Self {
            nodes,
            revisions,
            locks,
            audit,
            metrics: ControlMetrics::new(),
        }
    }

    /// Creates a node with `initial_payload` as revision 1.
    ///
    /// # Errors
    ///
    /// Returns a storage error if either record cannot be written.
    #[tracing::instrument(skip_all, fields(server_id = %server_id, node_id = tracing::field::Empty))]
    pub async fn create_node(
        &self,
        server_id: ServerId,
        token: &AgentToken,
        initial_payload: Payload,
        actor: &str,
    ) -> Result<Node> {
        let node_id = NodeId::generate();
        tracing::Span::current().record("node_id", tracing::field::display(node_id));
        let _guard = self.locks.acquire(node_id).await;

        // Revision first: the node record must never point at a missing revision.
        let first = self
            .revisions
            .append(&node_id, initial_payload, RevisionOrigin::Initial, actor)
            .await?;
        if first.revision_number != RevisionNumber::FIRST {
            return Err(Error::Internal {
                message: format!(
                    "new node {node_id} started at revision {}",
                    first.revision_number
                ),
            });
        }

        let node = Node::new(node_id, server_id, token.digest(), Utc::now());
        self.nodes.insert(&node).await?;

        tracing::info!("node created");
        self.audit
            .record(
                actor,
                AuditAction::NodeCreated,
                node_id.to_string(),
                json!({
                    "server_id": node.server_id.as_str(),
                    "desired_revision": node.desired_revision.get(),
                    "status": node.status.as_str(),
                }),
            )
            .await;
        Ok(node)
    }

    /// Stores `payload` as a new revision and makes it desired.
    ///
    /// `applied_revision` is untouched; the agent confirms later.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    #[tracing::instrument(skip(self, payload), fields(node_id = %node_id, size = payload.len()))]
    pub async fn push_desired_config(
        &self,
        node_id: &NodeId,
        payload: Payload,
        actor: &str,
    ) -> Result<Node> {
        let _guard = self.locks.acquire(*node_id).await;
        let previous = self.nodes.get(node_id).await?;

        let revision = self
            .revisions
            .append(node_id, payload, RevisionOrigin::Push, actor)
            .await?;
        let desired = revision.revision_number;

        let node = self
            .nodes
            .update(node_id, |node| {
                node.desired_revision = desired;
                node.last_apply_status = ApplyStatus::Pending;
                node.last_apply_message = None;
                Ok(())
            })
            .await?;

        tracing::info!(
            previous = previous.desired_revision.get(),
            desired = desired.get(),
            "desired config pushed"
        );
        self.audit
            .record(
                actor,
                AuditAction::DesiredConfigPushed,
                node_id.to_string(),
                json!({
                    "previous_desired_revision": previous.desired_revision.get(),
                    "desired_revision": desired.get(),
                    "previous_apply_status": previous.last_apply_status.as_str(),
                }),
            )
            .await;
        Ok(node)
    }

    /// Records what the agent reports it is running.
    ///
    /// The report is recorded even when `revision` is older than the desired
    /// revision. It also counts as agent contact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown node and
    /// [`Error::InvalidRevision`] if `revision` is not one of its revisions.
    #[tracing::instrument(
        skip(self, message),
        fields(node_id = %node_id, revision = revision.get(), outcome = outcome.as_str())
    )]
    pub async fn report_applied(
        &self,
        node_id: &NodeId,
        revision: RevisionNumber,
        outcome: ApplyOutcome,
        message: Option<String>,
        actor: &str,
    ) -> Result<Node> {
        let _guard = self.locks.acquire(*node_id).await;
        let previous = self.nodes.get(node_id).await?;

        if !self.revisions.exists(node_id, revision).await? {
            return Err(Error::invalid_revision(
                node_id,
                revision.get(),
                "revision does not exist for this node",
            ));
        }

        let now = Utc::now();
        let node = self
            .nodes
            .update(node_id, |node| {
                node.applied_revision = Some(revision);
                node.last_apply_status = outcome.into();
                node.last_apply_message.clone_from(&message);
                node.record_contact(now);
                Ok(())
            })
            .await?;

        self.metrics.record_apply_report(outcome.as_str());
        match outcome {
            ApplyOutcome::Success => tracing::info!("agent applied revision"),
            ApplyOutcome::Failed => tracing::warn!(
                detail = message.as_deref().unwrap_or(""),
                "agent failed to apply revision"
            ),
        }

        let mut summary = json!({
            "applied_revision": revision.get(),
            "outcome": outcome.as_str(),
            "desired_revision": node.desired_revision.get(),
            "previous_status": previous.status.as_str(),
            "status": node.status.as_str(),
        });
        if let Some(message) = &message {
            summary["message"] = json!(message);
        }
        self.audit
            .record(actor, AuditAction::ConfigApplied, node_id.to_string(), summary)
            .await;
        Ok(node)
    }

    /// Makes a copy of an earlier revision the new desired revision.
    ///
    /// Without a `target`, the greatest revision below the current desired
    /// revision is used. History is never rewritten: the copy gets a fresh
    /// number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown node and
    /// [`Error::InvalidRevision`] if the target does not exist or there is
    /// no earlier revision to return to.
    #[tracing::instrument(skip(self), fields(node_id = %node_id))]
    pub async fn rollback(
        &self,
        node_id: &NodeId,
        target: Option<RevisionNumber>,
        actor: &str,
    ) -> Result<Node> {
        let _guard = self.locks.acquire(*node_id).await;
        let previous = self.nodes.get(node_id).await?;
        let from = previous.desired_revision;

        let target = match target {
            Some(target) => target,
            None => self
                .revisions
                .latest_below(node_id, from)
                .await?
                .ok_or_else(|| {
                    Error::invalid_revision(
                        node_id,
                        from.get(),
                        "no earlier revision to roll back to",
                    )
                })?,
        };

        let source = self.revisions.load(node_id, target).await?.ok_or_else(|| {
            Error::invalid_revision(
                node_id,
                target.get(),
                "revision does not exist for this node",
            )
        })?;

        let copy = self
            .revisions
            .append(
                node_id,
                source.payload,
                RevisionOrigin::Rollback {
                    rolled_back_from: from,
                    target,
                },
                actor,
            )
            .await?;
        let desired = copy.revision_number;

        let node = self
            .nodes
            .update(node_id, |node| {
                node.desired_revision = desired;
                node.last_apply_status = ApplyStatus::Pending;
                node.last_apply_message = None;
                Ok(())
            })
            .await?;

        self.metrics.record_rollback();
        tracing::info!(
            from = from.get(),
            target = target.get(),
            desired = desired.get(),
            "rollback issued"
        );
        self.audit
            .record(
                actor,
                AuditAction::RollbackRequested,
                node_id.to_string(),
                json!({
                    "rolled_back_from": from.get(),
                    "target_revision": target.get(),
                    "desired_revision": desired.get(),
                }),
            )
            .await;
        Ok(node)
    }

    /// Disables or re-enables a node.
    ///
    /// Re-enabled nodes return to `pending` until the agent is heard from.
    /// Setting the state a node is already in changes nothing and is not
    /// audited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    #[tracing::instrument(skip(self), fields(node_id = %node_id))]
    pub async fn set_disabled(&self, node_id: &NodeId, disabled: bool, actor: &str) -> Result<Node> {
        let _guard = self.locks.acquire(*node_id).await;
        let previous = self.nodes.get(node_id).await?;

        if (previous.status == NodeStatus::Disabled) == disabled {
            return Ok(previous);
        }

        let node = self
            .nodes
            .update(node_id, |node| {
                node.status = if disabled {
                    NodeStatus::Disabled
                } else {
                    NodeStatus::Pending
                };
                Ok(())
            })
            .await?;

        let action = if disabled {
            AuditAction::NodeDisabled
        } else {
            AuditAction::NodeEnabled
        };
        tracing::info!(%action, status = %node.status, "node status changed by operator");
        self.audit
            .record(
                actor,
                action,
                node_id.to_string(),
                json!({
                    "previous_status": previous.status.as_str(),
                    "status": node.status.as_str(),
                }),
            )
            .await;
        Ok(node)
    }

    /// Returns one node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub async fn get_node(&self, node_id: &NodeId) -> Result<Node> {
        self.nodes.get(node_id).await
    }

    /// Lists nodes, most recently seen first.
    ///
    /// Nodes that were never seen come last; ties are broken by ID.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a record cannot be read.
    pub async fn list_nodes(&self, status: Option<NodeStatus>) -> Result<Vec<Node>> {
        let ids = self.nodes.list_ids().await?;
        let loaded = try_join_all(ids.iter().map(|id| self.nodes.load(id))).await?;

        let mut nodes: Vec<Node> = loaded
            .into_iter()
            .flatten()
            .map(|(node, _)| node)
            .filter(|node| status.map_or(true, |wanted| node.status == wanted))
            .collect();

        nodes.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(nodes)
    }
}
