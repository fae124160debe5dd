//! Node records and their storage.
//!
//! A node record holds the desired/applied revision pointers, the apply
//! status and the liveness fields. Records live at
//! `nodes/{node_id}/node.json` and every update is a read-modify-write
//! guarded by the object's version token.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::paths;
use fleet_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use fleet_core::token::TokenDigest;
use fleet_core::{Error, NodeId, Result, RevisionNumber, ServerId};

use crate::metrics::ControlMetrics;

/// Longest engine name or version string an agent may report.
pub const MAX_ENGINE_FIELD_LEN: usize = 64;

/// Proxy engine versions reported by an agent, keyed by engine name.
pub type EngineVersions = BTreeMap<String, String>;

/// Attempts made for a node-record compare-and-swap before giving up.
const CAS_ATTEMPTS: u32 = 2;

/// Reachability status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created or re-enabled, not heard from since.
    Pending,
    /// Heard from within the liveness threshold.
    Online,
    /// Marked offline by a sweep.
    Offline,
    /// Disabled by an operator.
    Disabled,
}

impl NodeStatus {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "disabled" => Ok(Self::Disabled),
            other => Err(Error::InvalidInput(format!("unknown node status '{other}'"))),
        }
    }
}

/// Outcome of the most recent apply attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Desired revision not yet confirmed.
    Pending,
    /// Agent applied the reported revision.
    Success,
    /// Agent failed to apply the reported revision.
    Failed,
}

impl ApplyStatus {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// What an agent reports after trying to apply a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The revision is running.
    Success,
    /// The revision could not be applied.
    Failed,
}

impl ApplyOutcome {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl From<ApplyOutcome> for ApplyStatus {
    fn from(value: ApplyOutcome) -> Self {
        match value {
            ApplyOutcome::Success => Self::Success,
            ApplyOutcome::Failed => Self::Failed,
        }
    }
}

/// One managed proxy node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier.
    pub id: NodeId,
    /// Server the node runs on.
    pub server_id: ServerId,
    /// Digest of the agent token. Never exposed outside the crate.
    pub(crate) token_digest: TokenDigest,
    /// Revision the operator wants running.
    pub desired_revision: RevisionNumber,
    /// Revision the agent last reported.
    pub applied_revision: Option<RevisionNumber>,
    /// Outcome of the last apply.
    pub last_apply_status: ApplyStatus,
    /// Free-form detail from the last apply report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_message: Option<String>,
    /// Reachability status.
    pub status: NodeStatus,
    /// Time of the last agent contact.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Engine versions from the latest heartbeat that carried them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engine_versions: EngineVersions,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last record update.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        server_id: ServerId,
        token_digest: TokenDigest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            server_id,
            token_digest,
            desired_revision: RevisionNumber::FIRST,
            applied_revision: None,
            last_apply_status: ApplyStatus::Pending,
            last_apply_message: None,
            status: NodeStatus::Pending,
            last_seen_at: None,
            engine_versions: EngineVersions::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the node has not been heard from within `threshold`
    /// of `reference`. A node that was never seen is stale.
    #[must_use]
    pub fn is_stale(&self, reference: DateTime<Utc>, threshold: Duration) -> bool {
        self.last_seen_at
            .map_or(true, |seen| reference.signed_duration_since(seen) > threshold)
    }

    /// Records agent contact at `now`.
    ///
    /// Pending and offline nodes come online; a disabled node stays disabled.
    pub(crate) fn record_contact(&mut self, now: DateTime<Utc>) {
        // Contact time never moves backwards.
        self.last_seen_at = Some(self.last_seen_at.map_or(now, |seen| seen.max(now)));
        if matches!(self.status, NodeStatus::Pending | NodeStatus::Offline) {
            self.status = NodeStatus::Online;
        }
    }

    /// Merges reported engine versions; engines not mentioned keep their
    /// previous version.
    pub(crate) fn record_engine_versions(&mut self, versions: &EngineVersions) {
        self.engine_versions.extend(
            versions
                .iter()
                .map(|(engine, version)| (engine.clone(), version.clone())),
        );
    }
}

/// Checks an agent-reported engine version map.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an empty engine name or a name or
/// version longer than [`MAX_ENGINE_FIELD_LEN`].
pub fn validate_engine_versions(versions: &EngineVersions) -> Result<()> {
    for (engine, version) in versions {
        if engine.trim().is_empty() {
            return Err(Error::InvalidInput("engine name cannot be empty".into()));
        }
        if engine.len() > MAX_ENGINE_FIELD_LEN || version.len() > MAX_ENGINE_FIELD_LEN {
            return Err(Error::InvalidInput(format!(
                "engine '{engine}' name and version must be at most {MAX_ENGINE_FIELD_LEN} bytes"
            )));
        }
    }
    Ok(())
}

/// Reads and conditionally writes node records.
#[derive(Clone)]
pub(crate) struct NodeStore {
    storage: Arc<dyn StorageBackend>,
    metrics: ControlMetrics,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore").finish_non_exhaustive()
    }
}

impl NodeStore {
    pub(crate) fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            metrics: ControlMetrics::new(),
        }
    }

    /// Loads a node together with its version token.
    pub(crate) async fn load(&self, id: &NodeId) -> Result<Option<(Node, String)>> {
        let Some(object) = self.storage.get(&paths::node_record(id)).await? else {
            return Ok(None);
        };
        let node: Node = serde_json::from_slice(&object.data)?;
        Ok(Some((node, object.version)))
    }

    pub(crate) async fn get(&self, id: &NodeId) -> Result<Node> {
        self.load(id)
            .await?
            .map(|(node, _)| node)
            .ok_or_else(|| Error::not_found("node", id))
    }

    pub(crate) async fn exists(&self, id: &NodeId) -> Result<bool> {
        Ok(self.storage.head(&paths::node_record(id)).await?.is_some())
    }

    /// Writes a brand-new node record.
    pub(crate) async fn insert(&self, node: &Node) -> Result<()> {
        let bytes = json_bytes(node)?;
        match self
            .storage
            .put(
                &paths::node_record(&node.id),
                bytes,
                WritePrecondition::DoesNotExist,
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => {
                self.metrics.record_cas_conflict("node");
                Err(Error::conflict(format!("node {} already exists", node.id)))
            }
        }
    }

    /// Applies `update_fn` to the current record and writes it back.
    ///
    /// A lost race re-reads the record and re-applies `update_fn` once
    /// before surfacing [`Error::Conflict`].
    pub(crate) async fn update<F>(&self, id: &NodeId, mut update_fn: F) -> Result<Node>
    where
        F: FnMut(&mut Node) -> Result<()>,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let (mut node, version) = self
                .load(id)
                .await?
                .ok_or_else(|| Error::not_found("node", id))?;

            update_fn(&mut node)?;
            node.updated_at = Utc::now();

            if self.compare_and_swap(&node, version).await? {
                return Ok(node);
            }

            self.metrics.record_cas_conflict("node");
            tracing::debug!(node_id = %id, attempt, "node update lost CAS race");
        }

        Err(Error::conflict(format!(
            "node {id} was modified concurrently; update abandoned"
        )))
    }

    /// Writes `node` if the stored version still equals `version`.
    ///
    /// Returns false when another writer got there first.
    pub(crate) async fn compare_and_swap(&self, node: &Node, version: String) -> Result<bool> {
        let result = self
            .storage
            .put(
                &paths::node_record(&node.id),
                json_bytes(node)?,
                WritePrecondition::MatchesVersion(version),
            )
            .await?;
        Ok(result.is_success())
    }

    /// Lists every node ID, in ID order.
    pub(crate) async fn list_ids(&self) -> Result<Vec<NodeId>> {
        let mut ids: Vec<NodeId> = self
            .storage
            .list(paths::NODES_PREFIX)
            .await?
            .iter()
            .filter_map(|meta| paths::parse_node_record(&meta.path))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

pub(crate) fn json_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}
