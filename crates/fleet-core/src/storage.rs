//! Storage backend abstraction for control-plane state.
//!
//! Node records and configuration revisions are stored as JSON objects in a
//! key/value store with object-store semantics:
//! - Conditional writes with preconditions (compare-and-swap)
//! - An opaque version token per object, bumped on every write
//! - Prefix listing
//!
//! Objects are never deleted: revisions are append-only and nodes are
//! disabled rather than erased, so the contract has no `delete`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
///
/// The version token is opaque; backends interpret it according to their
/// own semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// An object read together with its version token.
#[derive(Debug, Clone)]
pub struct VersionedObject {
    /// Object contents.
    pub data: Bytes,
    /// Version token to use with [`WritePrecondition::MatchesVersion`].
    pub version: String,
}

/// Storage backend trait for control-plane state.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an object together with its version.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Option<VersionedObject>>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: arbitrary. Callers requiring deterministic order must
    /// sort the results.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend.
///
/// Thread-safe via `RwLock`. Every write is atomic with respect to its
/// precondition check, which is what the revision allocator relies on.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::Internal {
            message: "lock poisoned".into(),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Option<VersionedObject>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;

        Ok(objects.get(path).map(|o| VersionedObject {
            data: o.data.clone(),
            version: o.version.to_string(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;

        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("test/file.json", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");

        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend
            .get("test/file.json")
            .await
            .expect("get should succeed")
            .expect("object should exist");
        assert_eq!(retrieved.data, data);
        assert_eq!(retrieved.version, "1");
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let backend = MemoryBackend::new();
        assert!(backend.get("missing").await.expect("get").is_none());
        assert!(backend.head("missing").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn test_precondition_does_not_exist() {
        let backend = MemoryBackend::new();

        let result = backend
            .put("new.json", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(result.is_success());

        let result = backend
            .put("new.json", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));

        let stored = backend.get("new.json").await.expect("get").expect("exists");
        assert_eq!(stored.data, Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_precondition_matches_version() {
        let backend = MemoryBackend::new();

        let first_version = match backend
            .put("gen.json", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("should succeed")
        {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => panic!("expected success"),
        };

        let result = backend
            .put(
                "gen.json",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first_version.clone()),
            )
            .await
            .expect("should succeed");
        assert!(result.is_success());

        // A stale version loses.
        let result = backend
            .put(
                "gen.json",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first_version),
            )
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { ref current_version } if current_version == "2"));
    }

    #[tokio::test]
    async fn test_matches_version_on_missing_object_fails() {
        let backend = MemoryBackend::new();
        let result = backend
            .put(
                "absent.json",
                Bytes::from("x"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .expect("should succeed");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MemoryBackend::new();

        for path in ["a/1.json", "a/2.json", "ab/1.json", "b/1.json"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        let list_a = backend.list("a/").await.expect("should succeed");
        assert_eq!(list_a.len(), 2);

        let list_b = backend.list("b/").await.expect("should succeed");
        assert_eq!(list_b.len(), 1);

        assert_eq!(backend.list("").await.expect("list").len(), 4);
    }
}
