//! Strongly-typed identifiers for control-plane entities.
//!
//! - [`NodeId`]: ULID, generated by the control plane when a node is created.
//! - [`ServerId`]: opaque reference into the external server directory.
//! - [`RevisionNumber`]: positive, per-node, strictly increasing.
//!
//! # Example
//!
//! ```rust
//! use fleet_core::id::{NodeId, RevisionNumber};
//!
//! let node = NodeId::generate();
//! let first = RevisionNumber::FIRST;
//! assert_eq!(first.next().get(), 2);
//! assert_eq!(node.to_string().len(), 26);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a managed proxy node.
///
/// ULIDs sort by creation time, which gives node listings a stable
/// tie-breaker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Ulid);

impl NodeId {
    /// Generates a new unique node ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a node ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid node ID '{s}': {e}")))
    }
}

/// Reference to the physical server a node runs on.
///
/// Owned by the external server directory; the control plane only stores it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a server ID, rejecting blank values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::InvalidInput("server ID cannot be empty".into()));
        }
        Ok(Self(value))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A per-node configuration revision number.
///
/// Starts at 1 and only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct RevisionNumber(u64);

impl RevisionNumber {
    /// The number assigned to a node's initial configuration.
    pub const FIRST: Self = Self(1);

    /// Creates a revision number, rejecting zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `value` is zero.
    pub fn new(value: u64) -> Result<Self> {
        if value == 0 {
            return Err(Error::InvalidInput(
                "revision numbers start at 1".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Returns the raw number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the number that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RevisionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for RevisionNumber {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RevisionNumber> for u64 {
    fn from(value: RevisionNumber) -> Self {
        value.0
    }
}

impl FromStr for RevisionNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u64 = s
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid revision number '{s}': {e}")))?;
        Self::new(value)
    }
}
