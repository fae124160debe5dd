//! Agent-facing operations.
//!
//! Every call presents the node's agent token. The token is checked against
//! the stored digest before anything else happens; an unknown node and a
//! wrong token are indistinguishable to the caller.

use serde::Serialize;

use fleet_core::{AgentToken, Error, NodeId, Payload, Result, RevisionNumber};

use crate::node::{validate_engine_versions, ApplyOutcome, EngineVersions, Node, NodeStore};
use crate::revision::{revision_for_node, RevisionStore};
use crate::{LivenessMonitor, ReconciliationTracker};

/// What an agent needs to converge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredConfig {
    /// Node the configuration is for.
    pub node_id: NodeId,
    /// Revision the agent should run.
    pub desired_revision: RevisionNumber,
    /// Revision the agent last reported.
    pub applied_revision: Option<RevisionNumber>,
    /// Configuration bytes of the desired revision.
    pub payload: Payload,
}

/// Token-checked entry point for node agents.
#[derive(Debug, Clone)]
pub struct AgentGateway {
    nodes: NodeStore,
    revisions: RevisionStore,
    tracker: ReconciliationTracker,
    liveness: LivenessMonitor,
}

fn agent_actor(node_id: &NodeId) -> String {
    format!("agent:{node_id}")
}

impl AgentGateway {
    pub(crate) fn new(
        nodes: NodeStore,
        revisions: RevisionStore,
        tracker: ReconciliationTracker,
        liveness: LivenessMonitor,
    ) -> Self {
        Self {
            nodes,
            revisions,
            tracker,
            liveness,
        }
    }

    async fn authenticate(&self, node_id: &NodeId, token: &AgentToken) -> Result<Node> {
        let unauthorized = || Error::Unauthorized {
            message: format!("agent credentials rejected for node {node_id}"),
        };
        let node = self.nodes.load(node_id).await?.map(|(node, _)| node);
        match node {
            Some(node) if node.token_digest.verify(token) => Ok(node),
            _ => {
                tracing::warn!(node_id = %node_id, "agent authentication failed");
                Err(unauthorized())
            }
        }
    }

    /// Reports the outcome of applying `revision`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] for a bad token and
    /// [`Error::InvalidRevision`] if `revision` is not one of the node's.
    pub async fn report_applied(
        &self,
        node_id: &NodeId,
        token: &AgentToken,
        revision: u64,
        outcome: ApplyOutcome,
        message: Option<String>,
    ) -> Result<Node> {
        self.authenticate(node_id, token).await?;
        let revision = revision_for_node(node_id, revision)?;
        self.tracker
            .report_applied(node_id, revision, outcome, message, &agent_actor(node_id))
            .await
    }

    /// Records a heartbeat from the agent, along with any engine versions
    /// it reports. An empty map leaves the stored versions untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] for a bad token and
    /// [`Error::InvalidInput`] for a malformed engine version map.
    pub async fn heartbeat(
        &self,
        node_id: &NodeId,
        token: &AgentToken,
        engines: &EngineVersions,
    ) -> Result<Node> {
        self.authenticate(node_id, token).await?;
        validate_engine_versions(engines)?;
        self.liveness
            .heartbeat_with_engines(node_id, &agent_actor(node_id), engines)
            .await
    }

    /// Returns the configuration the agent should be running.
    ///
    /// Read-only; does not count as a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] for a bad token.
    pub async fn desired_config(&self, node_id: &NodeId, token: &AgentToken) -> Result<DesiredConfig> {
        let node = self.authenticate(node_id, token).await?;
        let revision = self
            .revisions
            .load(node_id, node.desired_revision)
            .await?
            .ok_or_else(|| Error::Internal {
                message: format!(
                    "node {node_id} points at missing revision {}",
                    node.desired_revision
                ),
            })?;

        Ok(DesiredConfig {
            node_id: node.id,
            desired_revision: node.desired_revision,
            applied_revision: node.applied_revision,
            payload: revision.payload,
        })
    }
}
