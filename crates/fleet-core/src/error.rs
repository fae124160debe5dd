//! Error types and result aliases for the control plane.
//!
//! Errors are structured for programmatic handling: the HTTP layer maps each
//! variant to a stable error code, and callers can match on the variant to
//! decide whether a retry makes sense.

use std::fmt;

/// The result type used throughout the control plane.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The referenced node or revision does not exist.
    #[error("not found: {resource_type} with id {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A revision number does not belong to the node's history.
    #[error("invalid revision {revision} for node {node_id}: {reason}")]
    InvalidRevision {
        /// Node the revision was resolved against.
        node_id: String,
        /// The offending revision number (0 when no candidate existed).
        revision: u64,
        /// Why the revision was rejected.
        reason: String,
    },

    /// Concurrent writers raced past the per-node serialization boundary.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the lost race.
        message: String,
    },

    /// The agent presented a token that does not match the node.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Description of the failure (never contains the token).
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new invalid revision error.
    #[must_use]
    pub fn invalid_revision(
        node_id: impl fmt::Display,
        revision: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidRevision {
            node_id: node_id.to_string(),
            revision,
            reason: reason.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Returns true for errors that reflect a lost CAS race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            message: value.to_string(),
        }
    }
}
