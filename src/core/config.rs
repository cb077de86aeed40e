//! Client configuration.
//!
//! Everything the client does is driven by one [`ClientConfig`] value handed
//! over at construction; there is no process-wide state.

use std::fmt;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::cluster::address::{self, Endpoint};
use crate::core::connection::ConnectSettings;
use crate::proto::error::{Error, Result};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default maximum attempts per command (first try plus retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default number of pooled connections per node.
pub const DEFAULT_POOL_SIZE: usize = 8;
/// Port assumed for URLs without one.
pub const DEFAULT_PORT: u16 = 6379;

/// Credential passed through to `AUTH` on every new connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: Option<String>,
    password: String,
}

impl Credential {
    /// A password-only credential.
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            username: None,
            password: password.into(),
        }
    }

    /// An ACL username and password.
    pub fn with_username(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: password.into(),
        }
    }

    /// The ACL username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub(crate) fn password_str(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Construction configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// The first node to contact.
    pub primary: Endpoint,
    /// Comma-separated `host:port` list of further seed nodes.
    pub backup_addresses: Option<String>,
    /// Deadline for dialing a node and for waiting on an exhausted pool.
    pub connect_timeout: Duration,
    /// Deadline for each reply.
    pub read_timeout: Duration,
    /// Maximum attempts per command across redirections and reconnects.
    pub max_attempts: u32,
    /// Credential sent on connect.
    pub credential: Option<Credential>,
    /// Maximum connections per node.
    pub pool_size: usize,
}

impl ClientConfig {
    /// Creates a configuration with defaults for everything but the primary.
    pub fn new(primary: Endpoint) -> Self {
        Self {
            primary,
            backup_addresses: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            credential: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Parses a registry-style URL.
    ///
    /// ```text
    /// redis://[user[:password]@]host[:port]?backup=h1:p1,h2:p2
    ///     &connection.timeout=2000&so.timeout=2000&max.attempts=5&pool.size=8
    /// ```
    ///
    /// `db.index` is accepted and ignored: a cluster has a single keyspace.
    ///
    /// # Example
    ///
    /// ```
    /// use shardis::ClientConfig;
    ///
    /// let config = ClientConfig::from_url(
    ///     "redis://:secret@10.0.0.1:7000?backup=10.0.0.2:7001&max.attempts=3",
    /// ).unwrap();
    /// assert_eq!(config.primary.to_string(), "10.0.0.1:7000");
    /// assert_eq!(config.max_attempts, 3);
    /// assert!(config.credential.is_some());
    /// ```
    pub fn from_url(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| Error::Configuration {
            message: format!("invalid address {:?}: {}", input, e),
        })?;
        if url.scheme() != "redis" {
            return Err(Error::Configuration {
                message: format!("unsupported scheme {:?}, expected redis://", url.scheme()),
            });
        }
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| Error::Configuration {
            message: format!("missing host in {:?}", input),
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let mut config = Self::new(Endpoint::new(host, url.port().unwrap_or(DEFAULT_PORT)));

        if let Some(password) = url.password() {
            config.credential = Some(if url.username().is_empty() {
                Credential::password(password)
            } else {
                Credential::with_username(url.username(), password)
            });
        }

        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "backup" => config.backup_addresses = Some(value.into_owned()),
                "connection.timeout" => {
                    config.connect_timeout = Duration::from_millis(parse_param(&name, &value)?)
                }
                "so.timeout" => config.read_timeout = Duration::from_millis(parse_param(&name, &value)?),
                "max.attempts" => config.max_attempts = parse_param(&name, &value)?,
                "pool.size" => config.pool_size = parse_param(&name, &value)?,
                "db.index" => warn!(
                    db_index = %value,
                    "cluster mode does not support database selection, ignoring db.index"
                ),
                other => warn!(parameter = other, "ignoring unknown address parameter"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolves the primary and backup addresses into seed endpoints.
    pub fn seeds(&self) -> Result<Vec<Endpoint>> {
        address::resolve(&self.primary, self.backup_addresses.as_deref())
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Configuration {
                message: "pool size must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration {
                message: "max attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: Some(self.read_timeout),
            credential: self.credential.clone(),
        }
    }
}

fn parse_param<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::Configuration {
        message: format!("invalid value {:?} for parameter {}", value, name),
    })
}
