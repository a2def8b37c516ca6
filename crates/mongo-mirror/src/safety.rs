//! Destination safety gate.
//!
//! The mirror writes into its destination unconditionally, so the
//! destination must never be a hosted production cluster. Guards run before
//! any connection is opened and their verdict is final.

use crate::config::EndpointConfig;
use crate::error::{Error, Result};

/// Host suffix of MongoDB Atlas clusters. Always forbidden as a destination.
pub const ATLAS_HOST_SUFFIX: &str = "mongodb.net";

/// Predicate deciding whether an endpoint may be used as the destination.
pub trait DestinationGuard: Send + Sync {
    /// Returns [`Error::SafetyViolation`] if `endpoint` must not be written to.
    fn check(&self, endpoint: &EndpointConfig) -> Result<()>;
}

/// Rejects destinations whose hosts end with a forbidden suffix.
#[derive(Debug, Clone)]
pub struct HostSuffixGuard {
    suffixes: Vec<String>,
}

impl HostSuffixGuard {
    /// Guard for [`ATLAS_HOST_SUFFIX`] plus `extra` suffixes.
    #[must_use]
    pub fn new(extra: &[String]) -> Self {
        let mut suffixes = vec![ATLAS_HOST_SUFFIX.to_string()];
        for suffix in extra {
            let suffix = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
            if !suffix.is_empty() && !suffixes.contains(&suffix) {
                suffixes.push(suffix);
            }
        }
        Self { suffixes }
    }

    /// Forbidden suffixes, Atlas first.
    #[must_use]
    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }
}

impl Default for HostSuffixGuard {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl DestinationGuard for HostSuffixGuard {
    fn check(&self, endpoint: &EndpointConfig) -> Result<()> {
        let hosts = connection_hosts(&endpoint.connection_string);

        if hosts.is_empty() {
            let uri = endpoint.connection_string.to_ascii_lowercase();
            if let Some(suffix) = self.suffixes.iter().find(|s| uri.contains(s.as_str())) {
                return Err(Error::SafetyViolation(format!(
                    "connection string mentions forbidden host '{suffix}'"
                )));
            }
            return Ok(());
        }

        for host in &hosts {
            for suffix in &self.suffixes {
                if host == suffix || host.ends_with(&format!(".{suffix}")) {
                    return Err(Error::SafetyViolation(format!(
                        "destination host '{host}' matches forbidden suffix '{suffix}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Extracts the lowercase host names of a MongoDB connection string.
///
/// Handles credentials, seed lists, ports, bracketed IPv6 literals and the
/// `mongodb+srv` scheme.
#[must_use]
pub fn connection_hosts(uri: &str) -> Vec<String> {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let hosts = authority.rsplit_once('@').map_or(authority, |(_, hosts)| hosts);

    hosts
        .split(',')
        .filter_map(|host| {
            let host = host.trim();
            let name = match host.strip_prefix('[') {
                Some(v6) => v6.split(']').next().unwrap_or_default(),
                None => host.split(':').next().unwrap_or_default(),
            };
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            (!name.is_empty()).then_some(name)
        })
        .collect()
}
