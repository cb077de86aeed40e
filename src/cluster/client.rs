//! Cluster client.
//!
//! Wires the pool, topology tracker, dispatcher, scan aggregator and pub/sub
//! relay together behind one cloneable handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::address::Endpoint;
use crate::cluster::dispatcher::Dispatcher;
use crate::cluster::pool::{ConnectionPool, PoolConfig};
use crate::cluster::pubsub::{MessageListener, PubSubRelay, PublishOutcome, Subscription};
use crate::cluster::scan::{ScanAggregator, ScanOutcome};
use crate::cluster::topology::TopologyTracker;
use crate::core::capability::KvClient;
use crate::core::command::Cmd;
use crate::core::config::ClientConfig;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// State shared by every clone of a client.
#[derive(Debug)]
pub(crate) struct Shared {
    config: ClientConfig,
    pool: Arc<ConnectionPool>,
    tracker: Arc<TopologyTracker>,
    dispatcher: Dispatcher,
    scanner: ScanAggregator,
    relay: PubSubRelay,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    /// Validates `config`, builds the components and loads the first
    /// topology.
    pub(crate) async fn start(config: ClientConfig, standalone: bool) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from_client_config(&config)));
        let tracker = Arc::new(if standalone {
            TopologyTracker::standalone(config.primary.clone(), pool.clone())
        } else {
            TopologyTracker::new(config.seeds()?, pool.clone())
        });

        if let Err(e) = tracker.refresh().await {
            pool.close().await;
            return Err(e);
        }

        let dispatcher = Dispatcher::new(pool.clone(), tracker.clone(), config.max_attempts);
        let scanner = ScanAggregator::new(dispatcher.clone(), tracker.clone());
        let shutdown = CancellationToken::new();
        let relay = PubSubRelay::new(
            pool.clone(),
            tracker.clone(),
            dispatcher.clone(),
            shutdown.clone(),
        );

        let topology = tracker.snapshot();
        info!(
            primary = %config.primary,
            nodes = topology.nodes().len(),
            standalone,
            "client connected"
        );
        Ok(Self {
            config,
            pool,
            tracker,
            dispatcher,
            scanner,
            relay,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn tracker(&self) -> &TopologyTracker {
        &self.tracker
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) async fn execute(&self, cmd: Cmd) -> Result<Frame> {
        self.ensure_open()?;
        self.dispatcher.execute(cmd).await
    }

    pub(crate) async fn scan(&self, pattern: &str, cancel: &CancellationToken) -> Result<ScanOutcome> {
        self.ensure_open()?;
        self.scanner.scan(pattern, cancel).await
    }

    pub(crate) async fn psubscribe(
        &self,
        patterns: &[&str],
        listener: Arc<dyn MessageListener>,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        let patterns = patterns.iter().map(|p| p.to_string()).collect();
        self.relay.psubscribe(patterns, listener, cancel).await
    }

    pub(crate) async fn publish(&self, channel: &str, message: Bytes) -> Result<PublishOutcome> {
        self.ensure_open()?;
        self.relay.publish(channel, message).await
    }

    pub(crate) async fn refresh_topology(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.tracker.refresh().await?.version())
    }

    pub(crate) async fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let topology = self.tracker.snapshot();
        let endpoints: Vec<Endpoint> = if topology.is_empty() {
            self.tracker.seeds().to_vec()
        } else {
            topology.endpoints().cloned().collect()
        };
        self.pool.any_connected(&endpoints).await
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("client already closed");
            return;
        }
        self.shutdown.cancel();
        self.pool.close().await;
        info!(primary = %self.config.primary, "client closed");
    }
}

/// Client for a sharded cluster.
///
/// Routes each command to the node that owns its slot, follows `MOVED` and
/// `ASK` redirections, and refreshes the slot map when the cluster changes.
/// Clones share the same pools and topology.
///
/// # Example
///
/// ```no_run
/// use shardis::{ClientBuilder, KvClient};
///
/// # async fn demo() -> shardis::Result<()> {
/// let client = ClientBuilder::new()
///     .address("10.0.0.1:7000")
///     .backup_addresses("10.0.0.2:7001,10.0.0.3:7002")
///     .build()
///     .await?;
///
/// client.set("greeting", "hello").await?;
/// assert_eq!(client.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClusterClient {
    inner: Arc<Shared>,
}

impl ClusterClient {
    /// Connects to the cluster and loads its slot map.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for a bad config, or
    /// [`Error::TopologyUnavailable`] if no seed answers `CLUSTER SLOTS`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Shared::start(config, false).await?),
        })
    }

    /// Returns the configuration the client was built from.
    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    /// Number of master nodes in the current slot map.
    pub fn node_count(&self) -> usize {
        self.inner.tracker().snapshot().nodes().len()
    }

    /// Version of the current slot map.
    pub fn topology_version(&self) -> u64 {
        self.inner.tracker().version()
    }

    /// Reloads the slot map now and returns its new version.
    pub async fn refresh_topology(&self) -> Result<u64> {
        self.inner.refresh_topology().await
    }

    /// Connections currently checked out across all nodes.
    pub fn outstanding_connections(&self) -> usize {
        self.inner.pool().outstanding()
    }
}

impl KvClient for ClusterClient {
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
