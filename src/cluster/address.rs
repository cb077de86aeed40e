//! Node endpoints and seed address resolution.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::proto::error::{Error, Result};

/// Network address of one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint. IPv6 hosts are given without brackets.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host name or IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `host:port` or `[v6]:port`, tolerating blanks around the
    /// separator.
    fn from_str(token: &str) -> Result<Self> {
        let invalid = || Error::Configuration {
            message: format!("invalid address token {:?}, expected host:port", token),
        };
        let (host, port) = token.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim();
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port: u16 = port.trim().parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Endpoint::new(host, port))
    }
}

/// Resolves the primary endpoint plus an optional comma-separated backup
/// list into a deduplicated seed list, primary first.
///
/// Blank tokens are skipped. Any other token that is not a valid
/// `host:port` fails the whole call with [`Error::Configuration`].
///
/// ```
/// use shardis::cluster::address::{resolve, Endpoint};
///
/// let primary = Endpoint::new("10.0.0.1", 7000);
/// let seeds = resolve(&primary, Some("10.0.0.2:7001, 10.0.0.1:7000")).unwrap();
/// assert_eq!(seeds.len(), 2);
/// assert!(resolve(&primary, Some("badhost")).is_err());
/// ```
pub fn resolve(primary: &Endpoint, backup: Option<&str>) -> Result<Vec<Endpoint>> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();
    seen.insert(primary.clone());
    endpoints.push(primary.clone());

    let tokens = backup
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty());
    for token in tokens {
        let endpoint: Endpoint = token.parse()?;
        if seen.insert(endpoint.clone()) {
            endpoints.push(endpoint);
        }
    }
    Ok(endpoints)
}
