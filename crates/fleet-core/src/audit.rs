//! Audit record infrastructure.
//!
//! Every state-changing control-plane operation produces one [`AuditRecord`]
//! that is forwarded to the external Audit Log collaborator through the
//! [`AuditLog`] trait.
//!
//! ## Design Principles
//!
//! 1. **Never include secrets**: agent tokens are never recorded; actor
//!    strings that look like credentials are redacted.
//! 2. **Append-only semantics**: records are immutable once built.
//! 3. **Best effort**: an append failure is logged and counted, and never
//!    undoes the mutation that produced the record.
//!
//! ## Usage
//!
//! ```rust
//! use fleet_core::audit::{AuditAction, AuditRecord};
//!
//! let record = AuditRecord::builder()
//!     .action(AuditAction::DesiredConfigPushed)
//!     .actor("operator:alice")
//!     .entity_id("01J00000000000000000000000")
//!     .summary(serde_json::json!({ "desired_revision": 2 }))
//!     .try_build()
//!     .unwrap();
//!
//! assert_eq!(record.entity_type.as_str(), "node");
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of the audit record schema.
pub const AUDIT_RECORD_VERSION: u32 = 1;

/// Metric name: audit appends that failed or timed out.
pub const AUDIT_APPEND_FAILURES: &str = "fleet_audit_append_failures_total";

/// Default upper bound on a single `append` call.
pub const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Kind of entity an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A managed node.
    Node,
    /// A configuration revision.
    ConfigRevision,
}

impl EntityType {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::ConfigRevision => "config_revision",
        }
    }
}

/// State-changing actions that are audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AuditAction {
    /// A node was created with its initial revision.
    #[serde(rename = "node.created")]
    NodeCreated,
    /// A new configuration revision was stored.
    #[serde(rename = "config_revision.created")]
    RevisionCreated,
    /// The operator moved the desired pointer to a new revision.
    #[serde(rename = "node.desired_config_updated")]
    DesiredConfigPushed,
    /// The operator rolled back to a copy of an earlier revision.
    #[serde(rename = "node.rollback_requested")]
    RollbackRequested,
    /// The agent reported the outcome of applying a revision.
    #[serde(rename = "config.applied")]
    ConfigApplied,
    /// The agent sent a heartbeat.
    #[serde(rename = "node.heartbeat")]
    NodeHeartbeat,
    /// The liveness sweep marked the node offline.
    #[serde(rename = "node.marked_offline")]
    NodeMarkedOffline,
    /// The operator disabled the node.
    #[serde(rename = "node.disabled")]
    NodeDisabled,
    /// The operator re-enabled the node.
    #[serde(rename = "node.enabled")]
    NodeEnabled,
}

impl AuditAction {
    /// Returns the entity type this action is recorded against.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::RevisionCreated => EntityType::ConfigRevision,
            _ => EntityType::Node,
        }
    }

    /// Returns the wire name of the action.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NodeCreated => "node.created",
            Self::RevisionCreated => "config_revision.created",
            Self::DesiredConfigPushed => "node.desired_config_updated",
            Self::RollbackRequested => "node.rollback_requested",
            Self::ConfigApplied => "config.applied",
            Self::NodeHeartbeat => "node.heartbeat",
            Self::NodeMarkedOffline => "node.marked_offline",
            Self::NodeDisabled => "node.disabled",
            Self::NodeEnabled => "node.enabled",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
///
/// `summary` carries a small JSON object describing the change (revision
/// numbers, outcome, previous status). It never carries configuration
/// payloads or agent tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Schema version for evolution.
    pub record_version: u32,

    /// Unique record identifier (ULID format).
    pub event_id: String,

    /// Who performed the action (opaque actor identity).
    pub actor: String,

    /// What happened.
    pub action: AuditAction,

    /// Kind of entity affected.
    pub entity_type: EntityType,

    /// Identifier of the affected entity.
    pub entity_id: String,

    /// Change summary.
    pub summary: serde_json::Value,

    /// When the record was created (UTC).
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a new builder for constructing audit records.
    #[must_use]
    pub fn builder() -> AuditRecordBuilder {
        AuditRecordBuilder::default()
    }
}

/// Patterns that indicate potential secrets in audit data.
///
/// The third element marks patterns matched case-sensitively.
const SECRET_PATTERNS: &[(&str, &str, bool)] = &[
    ("bearer ", "bearer_token", false),
    ("eyJ", "jwt_token", true),
    ("token=", "token_param", false),
    ("key=", "key_param", false),
    ("secret=", "secret_param", false),
    ("password=", "password_param", false),
];

fn detect_secret_pattern(value: &str) -> Option<&'static str> {
    let lower = value.to_lowercase();
    SECRET_PATTERNS
        .iter()
        .find(|(pattern, _, case_sensitive)| {
            if *case_sensitive {
                value.contains(pattern)
            } else {
                lower.contains(pattern)
            }
        })
        .map(|(_, name, _)| *name)
}

fn redact_if_secret(value: &str) -> String {
    detect_secret_pattern(value).map_or_else(|| value.to_string(), |p| format!("[REDACTED:{p}]"))
}

/// Error type for audit record validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditValidationError {
    /// A required field is missing.
    #[error("audit record missing required field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: &'static str,
    },
}

/// Builder for constructing [`AuditRecord`] instances.
#[derive(Debug, Default)]
pub struct AuditRecordBuilder {
    action: Option<AuditAction>,
    actor: Option<String>,
    entity_id: Option<String>,
    summary: Option<serde_json::Value>,
    created_at: Option<DateTime<Utc>>,
}

impl AuditRecordBuilder {
    /// Sets the action for this record.
    #[must_use]
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Sets the actor identity.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the affected entity's identifier.
    #[must_use]
    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Sets the change summary.
    #[must_use]
    pub fn summary(mut self, summary: serde_json::Value) -> Self {
        self.summary = Some(summary);
        self
    }

    /// Overrides the creation timestamp (defaults to now).
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Builds the audit record.
    ///
    /// # Errors
    ///
    /// Returns an error if `action`, `actor` or `entity_id` is missing.
    pub fn try_build(self) -> Result<AuditRecord, AuditValidationError> {
        let action = self
            .action
            .ok_or(AuditValidationError::MissingField { field: "action" })?;
        let actor = self
            .actor
            .ok_or(AuditValidationError::MissingField { field: "actor" })?;
        let entity_id = self
            .entity_id
            .ok_or(AuditValidationError::MissingField { field: "entity_id" })?;

        Ok(AuditRecord {
            record_version: AUDIT_RECORD_VERSION,
            event_id: ulid::Ulid::new().to_string(),
            // SECURITY: redact (don't reject) so a hostile actor string
            // cannot suppress the record.
            actor: redact_if_secret(&actor),
            action,
            entity_type: action.entity_type(),
            entity_id,
            summary: self
                .summary
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

// ============================================================================
// Audit Log Collaborator
// ============================================================================

/// Error returned by an [`AuditLog`] that could not store a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit append failed: {message}")]
pub struct AuditAppendError {
    /// Description of the failure.
    pub message: String,
}

impl AuditAppendError {
    /// Creates a new append error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The external Audit Log collaborator.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends one record.
    async fn append(&self, record: AuditRecord) -> Result<(), AuditAppendError>;
}

/// Audit log that writes records as structured tracing events.
///
/// Records are emitted at INFO level with the `audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditAppendError> {
        tracing::info!(
            target: "audit",
            event_id = %record.event_id,
            action = %record.action,
            actor = %record.actor,
            entity_type = record.entity_type.as_str(),
            entity_id = %record.entity_id,
            summary = %record.summary,
            "audit_record"
        );
        Ok(())
    }
}

/// Audit log that captures records in memory.
///
/// Use this in tests to verify that expected records are produced.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    /// Creates a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all captured records.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Returns the number of captured records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Returns true if no records have been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the last captured record, if any.
    #[must_use]
    pub fn last(&self) -> Option<AuditRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|guard| guard.last().cloned())
    }

    /// Finds records by action.
    #[must_use]
    pub fn find_by_action(&self, action: AuditAction) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .filter(|r| r.action == action)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditAppendError> {
        self.records
            .lock()
            .map_err(|_| AuditAppendError::new("memory audit log poisoned"))?
            .push(record);
        Ok(())
    }
}

/// Audit log that rejects every record.
///
/// Models an unavailable collaborator.
#[derive(Debug, Default, Clone)]
pub struct FailingAuditLog;

#[async_trait]
impl AuditLog for FailingAuditLog {
    async fn append(&self, _record: AuditRecord) -> Result<(), AuditAppendError> {
        Err(AuditAppendError::new("audit log unavailable"))
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Forwards audit records to the collaborator, best effort.
#[derive(Clone)]
pub struct AuditEmitter {
    log: Arc<dyn AuditLog>,
    timeout: Duration,
}

impl std::fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEmitter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AuditEmitter {
    /// Creates an emitter for the given log.
    #[must_use]
    pub fn new(log: Arc<dyn AuditLog>) -> Self {
        Self {
            log,
            timeout: DEFAULT_APPEND_TIMEOUT,
        }
    }

    /// Creates an emitter backed by [`TracingAuditLog`].
    #[must_use]
    pub fn with_tracing() -> Self {
        Self::new(Arc::new(TracingAuditLog))
    }

    /// Sets the per-append timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forwards a record to the audit log.
    ///
    /// Failures and timeouts are logged and counted; they are never returned
    /// to the caller because the audited mutation has already happened.
    pub async fn emit(&self, record: AuditRecord) {
        let action = record.action;
        let entity_id = record.entity_id.clone();

        let outcome = match tokio::time::timeout(self.timeout, self.log.append(record)).await {
            Ok(result) => result,
            Err(_) => Err(AuditAppendError::new(format!(
                "append timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };

        if let Err(e) = outcome {
            metrics::counter!(AUDIT_APPEND_FAILURES, "action" => action.as_str()).increment(1);
            tracing::warn!(
                action = %action,
                entity_id = %entity_id,
                error = %e,
                "audit append failed; mutation kept"
            );
        }
    }

    /// Builds and forwards a record in one step.
    ///
    /// A record that fails validation is logged and dropped.
    pub async fn record(
        &self,
        actor: &str,
        action: AuditAction,
        entity_id: impl Into<String>,
        summary: serde_json::Value,
    ) {
        match AuditRecord::builder()
            .action(action)
            .actor(actor)
            .entity_id(entity_id)
            .summary(summary)
            .try_build()
        {
            Ok(record) => self.emit(record).await,
            Err(e) => tracing::warn!(action = %action, error = %e, "dropping invalid audit record"),
        }
    }
}
