//! # fleet-core
//!
//! Shared primitives for the proxy-fleet node configuration control plane.
//!
//! - **Identifiers**: strongly-typed node, server and revision identifiers
//! - **Storage**: object-store contract with compare-and-swap preconditions
//! - **Locking**: per-key async mutual exclusion
//! - **Audit**: record builder, collaborator trait and best-effort emitter
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use fleet_core::prelude::*;
//!
//! let node = NodeId::generate();
//! let path = fleet_core::paths::revision(&node, RevisionNumber::FIRST);
//! assert!(path.ends_with("00000000000000000001.json"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod paths;
pub mod payload;
pub mod storage;
pub mod token;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::audit::{AuditAction, AuditEmitter, AuditLog, AuditRecord, EntityType};
    pub use crate::error::{Error, Result};
    pub use crate::id::{NodeId, RevisionNumber, ServerId};
    pub use crate::lock::{KeyedGuard, KeyedLock};
    pub use crate::payload::Payload;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, VersionedObject, WritePrecondition, WriteResult,
    };
    pub use crate::token::{AgentToken, TokenDigest};
}

pub use audit::{
    AuditAction, AuditAppendError, AuditEmitter, AuditLog, AuditRecord, EntityType,
    FailingAuditLog, MemoryAuditLog, TracingAuditLog,
};
pub use error::{Error, Result};
pub use id::{NodeId, RevisionNumber, ServerId};
pub use lock::{KeyedGuard, KeyedLock};
pub use observability::{init_logging, node_span, sweep_span, LogFormat};
pub use payload::Payload;
pub use storage::{
    MemoryBackend, ObjectMeta, StorageBackend, VersionedObject, WritePrecondition, WriteResult,
};
pub use token::{AgentToken, TokenDigest};
