//! Revision Store: the append-only ledger of configuration payloads.
//!
//! Each revision is written to `nodes/{node_id}/revisions/{n:020}.json` with
//! a `DoesNotExist` precondition. Allocation is therefore a
//! compare-and-create: the next number is `max + 1`, and it is consumed only
//! when its record is written. Two writers that compute the same number
//! cannot both succeed, and a failed write leaves no hole behind.
//!
//! Stored revisions are never rewritten.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use fleet_core::audit::{AuditAction, AuditEmitter};
use fleet_core::lock::KeyedLock;
use fleet_core::paths;
use fleet_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use fleet_core::{Error, NodeId, Payload, Result, RevisionNumber};

use crate::metrics::ControlMetrics;
use crate::node::{json_bytes, NodeStore};

/// Attempts made to claim a revision slot before giving up.
const ALLOCATION_ATTEMPTS: u32 = 2;

/// Largest page returned by [`RevisionStore::list_revisions_page`].
pub const MAX_PAGE_SIZE: usize = 500;

/// Why a revision was created. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevisionOrigin {
    /// The node's first configuration.
    Initial,
    /// A new configuration supplied by an operator.
    Push,
    /// A copy of an earlier revision.
    Rollback {
        /// Desired revision at the time of the rollback.
        rolled_back_from: RevisionNumber,
        /// Revision whose payload was copied.
        target: RevisionNumber,
    },
}

impl RevisionOrigin {
    /// Returns the short label used in metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Push => "push",
            Self::Rollback { .. } => "rollback",
        }
    }
}

/// One immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRevision {
    /// Owning node.
    pub node_id: NodeId,
    /// Per-node sequence number.
    pub revision_number: RevisionNumber,
    /// Opaque configuration bytes.
    pub payload: Payload,
    /// Why this revision exists.
    pub origin: RevisionOrigin,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Actor that caused the revision.
    pub created_by: String,
}

/// One page of a node's revision history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionPage {
    /// Revisions in ascending order.
    pub revisions: Vec<ConfigRevision>,
    /// Cursor for the next page, if more revisions follow.
    pub next_after: Option<RevisionNumber>,
}

/// Converts a caller-supplied revision number, treating zero as a revision
/// that cannot belong to `node_id`.
///
/// # Errors
///
/// Returns [`Error::InvalidRevision`] for zero.
pub fn revision_for_node(node_id: &NodeId, raw: u64) -> Result<RevisionNumber> {
    RevisionNumber::new(raw)
        .map_err(|_| Error::invalid_revision(node_id, raw, "revision numbers start at 1"))
}

/// Append-only store of configuration revisions.
#[derive(Clone)]
pub struct RevisionStore {
    storage: Arc<dyn StorageBackend>,
    nodes: NodeStore,
    locks: Arc<KeyedLock<NodeId>>,
    audit: AuditEmitter,
    metrics: ControlMetrics,
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore").finish_non_exhaustive()
    }
}

impl RevisionStore {
    pub(crate) fn new(
        storage: Arc<dyn StorageBackend>,
        nodes: NodeStore,
        locks: Arc<KeyedLock<NodeId>>,
        audit: AuditEmitter,
    ) -> Self {
        Self {
            storage,
            nodes,
            locks,
            audit,
            metrics: ControlMetrics::new(),
        }
    }

    /// Stores `payload` as the node's next revision.
    ///
    /// The revision does not become desired; use
    /// [`ReconciliationTracker::push_desired_config`](crate::ReconciliationTracker::push_desired_config)
    /// for that.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist, or
    /// [`Error::Conflict`] if the slot could not be claimed.
    pub async fn create_revision(
        &self,
        node_id: &NodeId,
        payload: Payload,
        actor: &str,
    ) -> Result<ConfigRevision> {
        let _guard = self.locks.acquire(*node_id).await;
        if !self.nodes.exists(node_id).await? {
            return Err(Error::not_found("node", node_id));
        }
        self.append(node_id, payload, RevisionOrigin::Push, actor)
            .await
    }

    /// Claims the next revision slot and writes the record.
    ///
    /// Callers hold the node's lock.
    pub(crate) async fn append(
        &self,
        node_id: &NodeId,
        payload: Payload,
        origin: RevisionOrigin,
        actor: &str,
    ) -> Result<ConfigRevision> {
        for attempt in 1..=ALLOCATION_ATTEMPTS {
            let number = self
                .latest_number(node_id)
                .await?
                .map_or(RevisionNumber::FIRST, RevisionNumber::next);

            let revision = ConfigRevision {
                node_id: *node_id,
                revision_number: number,
                payload: payload.clone(),
                origin,
                created_at: Utc::now(),
                created_by: actor.to_string(),
            };

            match self
                .storage
                .put(
                    &paths::revision(node_id, number),
                    json_bytes(&revision)?,
                    WritePrecondition::DoesNotExist,
                )
                .await?
            {
                WriteResult::Success { .. } => {
                    self.metrics.record_revision_created(origin.label());
                    tracing::info!(
                        node_id = %node_id,
                        revision = number.get(),
                        origin = origin.label(),
                        size = revision.payload.len(),
                        "stored config revision"
                    );
                    self.audit
                        .record(
                            actor,
                            AuditAction::RevisionCreated,
                            format!("{node_id}/{number}"),
                            json!({
                                "node_id": node_id.to_string(),
                                "revision_number": number.get(),
                                "origin": origin,
                                "payload_bytes": revision.payload.len(),
                            }),
                        )
                        .await;
                    return Ok(revision);
                }
                WriteResult::PreconditionFailed { .. } => {
                    self.metrics.record_cas_conflict("revision");
                    tracing::debug!(
                        node_id = %node_id,
                        revision = number.get(),
                        attempt,
                        "revision slot already claimed"
                    );
                }
            }
        }

        Err(Error::conflict(format!(
            "could not allocate a revision number for node {node_id}"
        )))
    }

    /// Returns one revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node or the revision does not exist.
    pub async fn get_revision(
        &self,
        node_id: &NodeId,
        revision: RevisionNumber,
    ) -> Result<ConfigRevision> {
        if !self.nodes.exists(node_id).await? {
            return Err(Error::not_found("node", node_id));
        }
        self.load(node_id, revision)
            .await?
            .ok_or_else(|| Error::not_found("config_revision", format!("{node_id}/{revision}")))
    }

    /// Returns every revision of the node in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub async fn list_revisions(&self, node_id: &NodeId) -> Result<Vec<ConfigRevision>> {
        if !self.nodes.exists(node_id).await? {
            return Err(Error::not_found("node", node_id));
        }
        let numbers = self.numbers(node_id).await?;
        self.load_all(node_id, &numbers).await
    }

    /// Returns up to `limit` revisions numbered above `after`.
    ///
    /// Passing the returned `next_after` resumes the listing where it left
    /// off, even if revisions were appended in between.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `limit` is zero or above
    /// [`MAX_PAGE_SIZE`], or [`Error::NotFound`] for an unknown node.
    pub async fn list_revisions_page(
        &self,
        node_id: &NodeId,
        after: Option<RevisionNumber>,
        limit: usize,
    ) -> Result<RevisionPage> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if !self.nodes.exists(node_id).await? {
            return Err(Error::not_found("node", node_id));
        }

        let remaining: Vec<RevisionNumber> = self
            .numbers(node_id)
            .await?
            .into_iter()
            .filter(|n| after.map_or(true, |cursor| *n > cursor))
            .collect();

        let page = &remaining[..remaining.len().min(limit)];
        let next_after = if remaining.len() > limit {
            page.last().copied()
        } else {
            None
        };

        Ok(RevisionPage {
            revisions: self.load_all(node_id, page).await?,
            next_after,
        })
    }

    pub(crate) async fn exists(&self, node_id: &NodeId, revision: RevisionNumber) -> Result<bool> {
        Ok(self
            .storage
            .head(&paths::revision(node_id, revision))
            .await?
            .is_some())
    }

    /// Greatest revision number strictly below `revision`.
    pub(crate) async fn latest_below(
        &self,
        node_id: &NodeId,
        revision: RevisionNumber,
    ) -> Result<Option<RevisionNumber>> {
        Ok(self
            .numbers(node_id)
            .await?
            .into_iter()
            .rev()
            .find(|n| *n < revision))
    }

    pub(crate) async fn load(
        &self,
        node_id: &NodeId,
        revision: RevisionNumber,
    ) -> Result<Option<ConfigRevision>> {
        let Some(object) = self
            .storage
            .get(&paths::revision(node_id, revision))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&object.data)?))
    }

    async fn latest_number(&self, node_id: &NodeId) -> Result<Option<RevisionNumber>> {
        Ok(self.numbers(node_id).await?.last().copied())
    }

    /// All stored revision numbers in ascending order.
    async fn numbers(&self, node_id: &NodeId) -> Result<Vec<RevisionNumber>> {
        let mut numbers: Vec<RevisionNumber> = self
            .storage
            .list(&paths::revisions_prefix(node_id))
            .await?
            .iter()
            .filter_map(|meta| paths::parse_revision(&meta.path))
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    async fn load_all(
        &self,
        node_id: &NodeId,
        numbers: &[RevisionNumber],
    ) -> Result<Vec<ConfigRevision>> {
        let loaded = try_join_all(numbers.iter().map(|n| self.load(node_id, *n))).await?;
        numbers
            .iter()
            .zip(loaded)
            .map(|(n, revision)| {
                revision.ok_or_else(|| Error::Internal {
                    message: format!("revision {node_id}/{n} listed but not readable"),
                })
            })
            .collect()
    }
}
