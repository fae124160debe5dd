//! # fleet-control
//!
//! The node configuration control plane.
//!
//! - **Revision Store** ([`RevisionStore`]): append-only per-node ledger of
//!   configuration payloads
//! - **Reconciliation Tracker** ([`ReconciliationTracker`]): desired/applied
//!   pointers, apply status, push and rollback
//! - **Liveness Monitor** ([`LivenessMonitor`]): heartbeats and the offline
//!   sweep
//! - **Agent Gateway** ([`AgentGateway`]): token-checked operations for node
//!   agents
//!
//! Every state change is forwarded to the audit log through
//! [`fleet_core::AuditEmitter`].
//!
//! ## Example
//!
//! ```rust
//! use fleet_control::ControlPlane;
//! use fleet_core::{AgentToken, Payload, ServerId};
//!
//! # tokio_test::block_on(async {
//! let plane = ControlPlane::in_memory();
//! let node = plane
//!     .tracker()
//!     .create_node(
//!         ServerId::new("srv-1")?,
//!         &AgentToken::new("agent-token")?,
//!         Payload::from(r#"{"inbounds":[]}"#),
//!         "operator:alice",
//!     )
//!     .await?;
//!
//! let node = plane
//!     .tracker()
//!     .push_desired_config(&node.id, Payload::from(r#"{"inbounds":[{"tag":"x"}]}"#), "operator:alice")
//!     .await?;
//! assert_eq!(node.desired_revision.get(), 2);
//! # Ok::<(), fleet_core::Error>(())
//! # }).unwrap();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod config;
pub mod liveness;
pub mod metrics;
pub mod node;
pub mod revision;
pub mod tracker;

use std::sync::Arc;

use fleet_core::audit::{AuditEmitter, AuditLog, TracingAuditLog};
use fleet_core::lock::KeyedLock;
use fleet_core::storage::{MemoryBackend, StorageBackend};

pub use agent::{AgentGateway, DesiredConfig};
pub use config::ControlConfig;
pub use liveness::{LivenessMonitor, SweepCancellation, SweepReport};
pub use node::{ApplyOutcome, ApplyStatus, EngineVersions, Node, NodeStatus};
pub use revision::{ConfigRevision, RevisionOrigin, RevisionPage, RevisionStore};
pub use tracker::ReconciliationTracker;

/// The assembled control plane.
///
/// All components share one storage backend, one per-node lock table and
/// one audit emitter. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    revisions: RevisionStore,
    tracker: ReconciliationTracker,
    liveness: Arc<LivenessMonitor>,
    agents: AgentGateway,
}

impl ControlPlane {
    /// Assembles the control plane over `storage`, sending audit records to
    /// `audit_log`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        audit_log: Arc<dyn AuditLog>,
        config: &ControlConfig,
    ) -> Self {
        let nodes = node::NodeStore::new(Arc::clone(&storage));
        let locks = Arc::new(KeyedLock::new());
        let audit = AuditEmitter::new(audit_log).with_timeout(config.audit_timeout);

        let revisions = RevisionStore::new(
            storage,
            nodes.clone(),
            Arc::clone(&locks),
            audit.clone(),
        );
        let tracker = ReconciliationTracker::new(
            nodes.clone(),
            revisions.clone(),
            Arc::clone(&locks),
            audit.clone(),
        );
        let liveness = LivenessMonitor::new(nodes.clone(), locks, audit, config.sweep_batch_size);
        let agents = AgentGateway::new(nodes, revisions.clone(), tracker.clone(), liveness.clone());

        Self {
            revisions,
            tracker,
            liveness: Arc::new(liveness),
            agents,
        }
    }

    /// In-memory control plane that audits to tracing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::in_memory_with_audit(Arc::new(TracingAuditLog))
    }

    /// In-memory control plane with a caller-supplied audit log.
    #[must_use]
    pub fn in_memory_with_audit(audit_log: Arc<dyn AuditLog>) -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            audit_log,
            &ControlConfig::default(),
        )
    }

    /// The Revision Store.
    #[must_use]
    pub fn revisions(&self) -> &RevisionStore {
        &self.revisions
    }

    /// The Reconciliation Tracker.
    #[must_use]
    pub fn tracker(&self) -> &ReconciliationTracker {
        &self.tracker
    }

    /// The Liveness Monitor.
    #[must_use]
    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    /// The agent-facing gateway.
    #[must_use]
    pub fn agents(&self) -> &AgentGateway {
        &self.agents
    }
}
