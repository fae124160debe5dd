//! Server directory used to decorate node responses with a host name.
//!
//! The control plane never consults the directory; it only feeds display
//! fields in API responses.

use std::collections::BTreeMap;

use fleet_core::{Error, Result, ServerId};

/// Resolves a server identifier to a display host.
pub trait ServerDirectory: Send + Sync + std::fmt::Debug {
    /// Returns the host for `server_id`, if known.
    fn host(&self, server_id: &ServerId) -> Option<String>;
}

/// Directory backed by a fixed map, typically loaded from `FLEET_SERVERS`.
#[derive(Debug, Clone, Default)]
pub struct StaticServerDirectory {
    hosts: BTreeMap<String, String>,
}

impl StaticServerDirectory {
    /// Creates a directory from a `server_id -> host` map.
    #[must_use]
    pub fn new(hosts: BTreeMap<String, String>) -> Self {
        Self { hosts }
    }
}

impl ServerDirectory for StaticServerDirectory {
    fn host(&self, server_id: &ServerId) -> Option<String> {
        self.hosts.get(server_id.as_str()).cloned()
    }
}

/// Parses `id=host,id=host` into a map.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming `name` for a malformed entry.
pub fn parse_server_list(name: &str, value: &str) -> Result<BTreeMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, host) = entry.split_once('=').ok_or_else(|| {
                Error::InvalidInput(format!("{name} entry '{entry}' must be id=host"))
            })?;
            let (id, host) = (id.trim(), host.trim());
            if id.is_empty() || host.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "{name} entry '{entry}' must be id=host"
                )));
            }
            Ok((id.to_string(), host.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_and_ignores_blanks() {
        let hosts = parse_server_list("FLEET_SERVERS", " eu-1=10.0.0.1 , ,us-2 = edge.example ").unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["eu-1"], "10.0.0.1");
        assert_eq!(hosts["us-2"], "edge.example");
    }

    #[test]
    fn rejects_entries_without_host() {
        for bad in ["eu-1", "eu-1=", "=host"] {
            let err = parse_server_list("FLEET_SERVERS", bad).unwrap_err();
            assert!(err.to_string().contains("FLEET_SERVERS"), "{bad}");
        }
    }

    #[test]
    fn lookup_by_server_id() {
        let directory = StaticServerDirectory::new(
            parse_server_list("FLEET_SERVERS", "eu-1=10.0.0.1").unwrap(),
        );
        assert_eq!(
            directory.host(&ServerId::new("eu-1").unwrap()).as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(directory.host(&ServerId::new("eu-2").unwrap()), None);
    }
}
