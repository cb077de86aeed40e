use std::time::Duration;

use crate::cluster::address::Endpoint;
use crate::cluster::ClusterClient;
use crate::core::config::{ClientConfig, Credential};
use crate::{Client, Error, Result};

/// Builder for configuring and creating a [`ClusterClient`] or a single-node
/// [`Client`].
///
/// # Example
///
/// ```no_run
/// use shardis::ClientBuilder;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClientBuilder::new()
///     .address("10.0.0.1:7000")
///     .backup_addresses("10.0.0.2:7001,10.0.0.3:7002")
///     .password("secret")
///     .connect_timeout(Duration::from_secs(1))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClientBuilder {
    address: Option<String>,
    backup_addresses: Option<String>,
    password: Option<String>,
    username: Option<String>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    max_attempts: Option<u32>,
    pool_size: Option<usize>,
}

impl ClientBuilder {
    /// Creates a new [`ClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary node address.
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port`, or a `redis://` URL carrying any of the
    ///   parameters accepted by [`ClientConfig::from_url`]
    #[inline]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets further seed nodes.
    ///
    /// # Arguments
    ///
    /// * `addresses` - Comma-separated `host:port` list
    #[inline]
    pub fn backup_addresses(mut self, addresses: impl Into<String>) -> Self {
        self.backup_addresses = Some(addresses.into());
        self
    }

    /// Sets the password for authentication.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the username for ACL authentication. Requires a password.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the connect timeout, also used when waiting for a pooled
    /// connection.
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-reply read timeout.
    #[inline]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the attempt cap per command.
    ///
    /// # Arguments
    ///
    /// * `attempts` - At least 1 (default: 5)
    #[inline]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the maximum number of connections per node.
    ///
    /// # Arguments
    ///
    /// * `size` - At least 1 (default: 8)
    #[inline]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Resolves the settings into a [`ClientConfig`] without connecting.
    ///
    /// Explicit setters override values carried in a URL address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if address is not set.
    /// Returns [`Error::Configuration`] for malformed addresses or values.
    pub fn into_config(self) -> Result<ClientConfig> {
        let address = self.address.ok_or_else(|| Error::InvalidArgument {
            message: "address is required".to_string(),
        })?;

        let mut config = if address.contains("://") {
            ClientConfig::from_url(&address)?
        } else {
            ClientConfig::new(address.parse::<Endpoint>()?)
        };

        if let Some(backups) = self.backup_addresses {
            config.backup_addresses = Some(backups);
        }
        match (self.username, self.password) {
            (Some(username), Some(password)) => {
                config.credential = Some(Credential::with_username(username, password))
            }
            (None, Some(password)) => config.credential = Some(Credential::password(password)),
            (Some(_), None) => {
                return Err(Error::Configuration {
                    message: "username requires a password".to_string(),
                })
            }
            (None, None) => {}
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = timeout;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        if let Some(size) = self.pool_size {
            config.pool_size = size;
        }

        config.validate()?;
        config.seeds()?;
        Ok(config)
    }

    /// Builds a [`ClusterClient`] and loads the slot map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if address is not set.
    /// Returns [`Error::TopologyUnavailable`] if no seed answers.
    #[inline]
    pub async fn build(self) -> Result<ClusterClient> {
        ClusterClient::connect(self.into_config()?).await
    }

    /// Builds a [`Client`] talking to the primary node only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if address is not set.
    /// Returns [`Error::TopologyUnavailable`] if the node does not answer.
    #[inline]
    pub async fn build_standalone(self) -> Result<Client> {
        Client::connect(self.into_config()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DEFAULT_MAX_ATTEMPTS, DEFAULT_POOL_SIZE};

    #[test]
    fn test_builder_new() {
        let builder = ClientBuilder::new();
        assert!(builder.address.is_none());
        assert!(builder.password.is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let config = ClientBuilder::new()
            .address("10.0.0.1:7000")
            .backup_addresses("10.0.0.2:7001")
            .username("registry")
            .password("secret")
            .connect_timeout(Duration::from_millis(750))
            .read_timeout(Duration::from_millis(900))
            .max_attempts(3)
            .pool_size(2)
            .into_config()
            .unwrap();

        assert_eq!(config.primary, Endpoint::new("10.0.0.1", 7000));
        assert_eq!(config.backup_addresses.as_deref(), Some("10.0.0.2:7001"));
        let credential = config.credential.as_ref().unwrap();
        assert_eq!(credential.username(), Some("registry"));
        assert_eq!(config.connect_timeout, Duration::from_millis(750));
        assert_eq!(config.read_timeout, Duration::from_millis(900));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.pool_size, 2);
    }

    #[test]
    fn test_builder_defaults() {
        let config = ClientBuilder::new().address("node:7000").into_config().unwrap();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert!(config.credential.is_none());
    }

    #[test]
    fn test_setters_override_url() {
        let config = ClientBuilder::new()
            .address("redis://10.0.0.1:7000?max.attempts=2&pool.size=4")
            .max_attempts(7)
            .into_config()
            .unwrap();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            ClientBuilder::new().address("node:notaport").into_config(),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            ClientBuilder::new().address("node:7000").pool_size(0).into_config(),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            ClientBuilder::new().address("node:7000").username("u").into_config(),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            ClientBuilder::new()
                .address("node:7000")
                .backup_addresses("node:7001,broken")
                .into_config(),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_builder_build_without_address() {
        let builder = ClientBuilder::new();
        let result = builder.build().await;
        assert!(result.is_err());
        match result {
            Err(Error::InvalidArgument { message }) => {
                assert_eq!(message, "address is required");
            }
            _ => panic!("Expected InvalidArgument error"),
        }
    }
}
