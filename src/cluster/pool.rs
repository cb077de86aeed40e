//! Per-node connection pools.
//!
//! Each node gets a bounded pool created lazily on first use. A connection is
//! handed out as a [`PooledConnection`] guard that returns it exactly once,
//! when the guard is dropped, on every exit path of the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info};

use crate::cluster::address::Endpoint;
use crate::core::command;
use crate::core::config::ClientConfig;
use crate::core::connection::{ConnectSettings, Connection};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections per node.
    pub max_connections_per_node: usize,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout: Duration,
    /// Settings for dialing new connections.
    pub connect: ConnectSettings,
}

impl PoolConfig {
    /// Derives pool settings from the client configuration. Waiting for a free
    /// connection is bounded by the connect timeout.
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            max_connections_per_node: config.pool_size,
            acquire_timeout: config.connect_timeout,
            connect: config.connect_settings(),
        }
    }
}

/// Connections of one node.
#[derive(Debug)]
struct NodePool {
    endpoint: Endpoint,
    permits: Arc<Semaphore>,
    idle: Mutex<NodeIdle>,
}

#[derive(Debug, Default)]
struct NodeIdle {
    connections: Vec<Connection>,
    evicted: bool,
}

impl NodePool {
    fn new(endpoint: Endpoint, size: usize) -> Self {
        Self {
            endpoint,
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(NodeIdle::default()),
        }
    }

    fn take_idle(&self) -> Option<Connection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.connections.pop() {
            if conn.is_connected() {
                return Some(conn);
            }
        }
        None
    }

    fn give_back(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if !idle.evicted && conn.is_connected() {
            idle.connections.push(conn);
        }
    }

    fn shut(&self) -> usize {
        let mut idle = self.idle.lock();
        idle.evicted = true;
        self.permits.close();
        let closed = idle.connections.len();
        idle.connections.clear();
        closed
    }
}

/// A connection checked out of a node pool.
///
/// Dropping the guard (or calling [`release`](Self::release)) returns the
/// connection. Broken connections, connections abandoned mid-request and
/// connections of evicted nodes are closed instead of pooled.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    node: Arc<NodePool>,
    outstanding: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The node this connection belongs to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.node.endpoint
    }

    /// Sends a frame and waits for the reply.
    pub async fn request(&mut self, frame: &Frame) -> Result<Frame> {
        match self.conn.as_mut() {
            Some(conn) => conn.request(frame).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Returns true while the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_connected)
    }

    /// Returns the connection to its pool.
    pub fn release(self) {}
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.node.give_back(conn);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Connection pools for every node the client talks to.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    nodes: RwLock<HashMap<Endpoint, Arc<NodePool>>>,
    outstanding: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Creates an empty pool manager.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            outstanding: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn node(&self, endpoint: &Endpoint) -> Result<Arc<NodePool>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(node) = self.nodes.read().await.get(endpoint) {
            return Ok(node.clone());
        }
        let mut nodes = self.nodes.write().await;
        // Re-check under the write lock so a concurrent close cannot leave a
        // fresh node behind.
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let node = nodes.entry(endpoint.clone()).or_insert_with(|| {
            debug!(%endpoint, "creating node pool");
            Arc::new(NodePool::new(
                endpoint.clone(),
                self.config.max_connections_per_node,
            ))
        });
        Ok(node.clone())
    }

    /// Checks out a connection to `endpoint`, dialing one if no idle
    /// connection is available.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the pool stays exhausted for the acquire timeout,
    /// [`Error::ConnectionClosed`] if the node is evicted while waiting,
    /// [`Error::Closed`] after [`close`](Self::close), or any dial error.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        let node = self.node(endpoint).await?;
        let wait = node.permits.clone().acquire_owned();
        let permit = match tokio::time::timeout(self.config.acquire_timeout, wait).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) if self.is_closed() => return Err(Error::Closed),
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "waiting for a pooled connection",
                    after: self.config.acquire_timeout,
                })
            }
        };

        let conn = match node.take_idle() {
            Some(conn) => conn,
            None => Connection::connect(endpoint, &self.config.connect).await?,
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection {
            conn: Some(conn),
            node,
            outstanding: self.outstanding.clone(),
            _permit: permit,
        })
    }

    /// Opens a connection outside the pool, without a read timeout, for
    /// long-lived subscriptions.
    pub async fn connect_dedicated(&self, endpoint: &Endpoint) -> Result<Connection<TcpStream>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let settings = ConnectSettings {
            read_timeout: None,
            ..self.config.connect.clone()
        };
        Connection::connect(endpoint, &settings).await
    }

    /// Closes and forgets every pooled connection of `endpoint`.
    ///
    /// Connections currently checked out are closed when returned.
    pub async fn evict(&self, endpoint: &Endpoint) {
        let removed = self.nodes.write().await.remove(endpoint);
        if let Some(node) = removed {
            let closed = node.shut();
            info!(%endpoint, idle_closed = closed, "evicted node pool");
        }
    }

    /// Endpoints that currently have a pool.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Number of idle connections pooled for `endpoint`.
    pub async fn idle_count(&self, endpoint: &Endpoint) -> usize {
        match self.nodes.read().await.get(endpoint) {
            Some(node) => node.idle.lock().connections.len(),
            None => 0,
        }
    }

    /// Number of connections currently checked out across all nodes.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Returns true as soon as one of `endpoints` hands out a connection that
    /// answers `PING`. Every probed connection is returned before the next
    /// node is tried.
    pub async fn any_connected(&self, endpoints: &[Endpoint]) -> bool {
        let ping = command::ping().into_frame();
        for endpoint in endpoints {
            let mut conn = match self.acquire(endpoint).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(%endpoint, error = %e, "liveness probe could not acquire");
                    continue;
                }
            };
            let healthy = match conn.request(&ping).await {
                Ok(reply) => !reply.is_error(),
                Err(e) => {
                    debug!(%endpoint, error = %e, "liveness probe failed");
                    false
                }
            };
            conn.release();
            if healthy {
                return true;
            }
        }
        false
    }

    /// Returns true after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Evicts every node and refuses further acquisitions. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let nodes: Vec<_> = self.nodes.write().await.drain().collect();
        for (endpoint, node) in nodes {
            let closed = node.shut();
            debug!(%endpoint, idle_closed = closed, "closed node pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;

    fn pool_config(size: usize, acquire_timeout: Duration) -> PoolConfig {
        PoolConfig {
            max_connections_per_node: size,
            acquire_timeout,
            connect: ConnectSettings {
                connect_timeout: Duration::from_secs(1),
                read_timeout: Some(Duration::from_secs(1)),
                credential: None,
            },
        }
    }

    #[tokio::test]
    async fn test_release_returns_connection_to_idle() {
        let cluster = MockCluster::start(1).await;
        let endpoint = cluster.endpoint(0);
        let pool = ConnectionPool::new(pool_config(2, Duration::from_secs(1)));

        let mut conn = pool.acquire(&endpoint).await.unwrap();
        assert_eq!(pool.outstanding(), 1);
        let reply = conn.request(&command::ping().into_frame()).await.unwrap();
        assert_eq!(reply, Frame::simple("PONG"));
        conn.release();

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle_count(&endpoint).await, 1);

        // The idle connection is reused rather than dialing again.
        let conn = pool.acquire(&endpoint).await.unwrap();
        assert_eq!(pool.idle_count(&endpoint).await, 0);
        drop(conn);
        assert_eq!(cluster.connections_accepted(0), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let cluster = MockCluster::start(1).await;
        let endpoint = cluster.endpoint(0);
        let pool = ConnectionPool::new(pool_config(1, Duration::from_millis(100)));

        let held = pool.acquire(&endpoint).await.unwrap();
        let err = pool.acquire(&endpoint).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(pool.outstanding(), 1);

        drop(held);
        assert!(pool.acquire(&endpoint).await.is_ok());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_evict_discards_returned_connection() {
        let cluster = MockCluster::start(1).await;
        let endpoint = cluster.endpoint(0);
        let pool = ConnectionPool::new(pool_config(2, Duration::from_secs(1)));

        let idle = pool.acquire(&endpoint).await.unwrap();
        let held = pool.acquire(&endpoint).await.unwrap();
        drop(idle);
        assert_eq!(pool.idle_count(&endpoint).await, 1);

        pool.evict(&endpoint).await;
        assert!(pool.endpoints().await.is_empty());
        drop(held);
        assert_eq!(pool.outstanding(), 0);

        // A fresh pool is created lazily on next use.
        let conn = pool.acquire(&endpoint).await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count(&endpoint).await, 1);
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_nothing_outstanding() {
        let cluster = MockCluster::start(1).await;
        let endpoint = cluster.endpoint(0);
        cluster.kill_node(0);
        let pool = ConnectionPool::new(pool_config(1, Duration::from_secs(1)));

        assert!(pool.acquire(&endpoint).await.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_any_connected() {
        let cluster = MockCluster::start(2).await;
        let pool = ConnectionPool::new(pool_config(1, Duration::from_secs(1)));
        let endpoints = cluster.endpoints();

        assert!(pool.any_connected(&endpoints).await);
        assert_eq!(pool.outstanding(), 0);

        cluster.kill_node(0);
        assert!(pool.any_connected(&endpoints).await);

        cluster.kill_node(1);
        assert!(!pool.any_connected(&endpoints).await);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let cluster = MockCluster::start(1).await;
        let pool = ConnectionPool::new(pool_config(1, Duration::from_secs(1)));
        pool.close().await;
        pool.close().await;
        assert!(matches!(
            pool.acquire(&cluster.endpoint(0)).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            pool.connect_dedicated(&cluster.endpoint(0)).await,
            Err(Error::Closed)
        ));
    }
}
