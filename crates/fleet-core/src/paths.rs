//! Storage key layout for node records and configuration revisions.
//!
//! ```text
//! nodes/{node_id}/node.json
//! nodes/{node_id}/revisions/{revision:020}.json
//! ```
//!
//! Revision numbers are zero-padded so lexicographic key order matches
//! numeric order.

use crate::id::{NodeId, RevisionNumber};

/// Root prefix for all node state.
pub const NODES_PREFIX: &str = "nodes/";

const NODE_RECORD_FILE: &str = "node.json";
const REVISIONS_DIR: &str = "revisions/";
const REVISION_SUFFIX: &str = ".json";

/// Path of a node's record.
#[must_use]
pub fn node_record(node_id: &NodeId) -> String {
    format!("{NODES_PREFIX}{node_id}/{NODE_RECORD_FILE}")
}

/// Prefix under which all of a node's revisions live.
#[must_use]
pub fn revisions_prefix(node_id: &NodeId) -> String {
    format!("{NODES_PREFIX}{node_id}/{REVISIONS_DIR}")
}

/// Path of one revision.
#[must_use]
pub fn revision(node_id: &NodeId, revision: RevisionNumber) -> String {
    format!(
        "{}{:020}{REVISION_SUFFIX}",
        revisions_prefix(node_id),
        revision.get()
    )
}

/// Extracts the revision number from a revision path.
///
/// Returns `None` for paths that are not revision objects.
#[must_use]
pub fn parse_revision(path: &str) -> Option<RevisionNumber> {
    let (_, file) = path.rsplit_once(REVISIONS_DIR)?;
    let digits = file.strip_suffix(REVISION_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| RevisionNumber::new(n).ok())
}

/// Extracts the node ID from a node record path.
///
/// Returns `None` for anything other than `nodes/{id}/node.json`.
#[must_use]
pub fn parse_node_record(path: &str) -> Option<NodeId> {
    let rest = path.strip_prefix(NODES_PREFIX)?;
    let (id, file) = rest.split_once('/')?;
    if file != NODE_RECORD_FILE {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn node() -> NodeId {
        NodeId::from_ulid(Ulid::nil())
    }

    #[test]
    fn builds_node_paths() {
        assert_eq!(
            node_record(&node()),
            "nodes/00000000000000000000000000/node.json"
        );
        assert_eq!(
            revision(&node(), RevisionNumber::new(42).unwrap()),
            "nodes/00000000000000000000000000/revisions/00000000000000000042.json"
        );
    }

    #[test]
    fn revision_keys_sort_numerically() {
        let nine = revision(&node(), RevisionNumber::new(9).unwrap());
        let ten = revision(&node(), RevisionNumber::new(10).unwrap());
        assert!(nine < ten);
    }

    #[test]
    fn parses_revision_paths() {
        let path = revision(&node(), RevisionNumber::new(7).unwrap());
        assert_eq!(parse_revision(&path), RevisionNumber::new(7).ok());
        assert_eq!(parse_revision(&node_record(&node())), None);
        assert_eq!(parse_revision("nodes/x/revisions/abc.json"), None);
        assert_eq!(parse_revision("nodes/x/revisions/0.json"), None);
    }

    #[test]
    fn parses_node_record_paths() {
        assert_eq!(parse_node_record(&node_record(&node())), Some(node()));
        assert_eq!(
            parse_node_record(&revision(&node(), RevisionNumber::FIRST)),
            None
        );
        assert_eq!(parse_node_record("nodes/bogus/node.json"), None);
    }
}
