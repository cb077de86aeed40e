//! # Core
//!
//! Connections, command construction, configuration and the client surface
//! shared by cluster and single-node deployments.
//!
//! ## Modules
//!
//! - [`connection`] - Single connection management
//! - [`command`] - Command builders and reply conversion
//! - [`config`] - Client configuration
//! - [`builder`] - Client builder
//! - [`capability`] - The [`KvClient`](capability::KvClient) trait
//!

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use crate::proto::error::{Error, Result};

use crate::cluster::client::Shared;
use crate::cluster::pubsub::{MessageListener, PublishOutcome, Subscription};
use crate::cluster::scan::ScanOutcome;
use crate::proto::frame::Frame;

/// Client builder configuration.
pub mod builder;
/// The client capability trait.
pub mod capability;
/// Command construction helpers.
pub mod command;
/// Client configuration.
pub mod config;
/// Low-level connection management.
pub mod connection;

use capability::KvClient;
use command::Cmd;
use config::ClientConfig;

/// Client for a single node that is not part of a cluster.
///
/// Every command goes to the primary endpoint; backup addresses are ignored.
/// Offers the same [`KvClient`] surface as
/// [`ClusterClient`](crate::ClusterClient).
///
/// # Example
///
/// ```no_run
/// use shardis::{ClientBuilder, KvClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = ClientBuilder::new()
///         .address("redis://localhost:6379")
///         .build_standalone()
///         .await?;
///     client.set("key", "value").await?;
///     let value = client.get("key").await?;
///     assert!(value.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Shared>,
}

impl Client {
    /// Connects to `config.primary` and checks that it answers `PING`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for a bad config, or
    /// [`Error::TopologyUnavailable`] if the node does not answer.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Shared::start(config, true).await?),
        })
    }

    /// Returns the configuration the client was built from.
    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    /// Sends `PING` and returns the reply text.
    pub async fn ping(&self) -> Result<String> {
        command::frame_to_string(self.inner.execute(command::ping()).await?)
    }
}

impl KvClient for Client {
    async fn execute(&self, cmd: Cmd) -> Result<Frame> {
        self.inner.execute(cmd).await
    }

    async fn scan_with_cancel(&self, pattern: &str, cancel: &CancellationToken) -> Result<ScanOutcome> {
        self.inner.scan(pattern, cancel).await
    }

    async fn psubscribe_with_cancel(
        &self,
        patterns: &[&str],
        listener: Arc<dyn MessageListener>,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        self.inner.psubscribe(patterns, listener, cancel).await
    }

    async fn publish(&self, channel: &str, message: impl Into<Bytes> + Send) -> Result<PublishOutcome> {
        self.inner.publish(channel, message.into()).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
