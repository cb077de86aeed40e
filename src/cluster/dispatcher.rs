//! Slot routing with redirect handling.
//!
//! | Failure                   | Action                                         |
//! |---------------------------|------------------------------------------------|
//! | `MOVED`                   | refresh topology, retry on the new owner       |
//! | `ASK`                     | retry once on the named node after `ASKING`    |
//! | `CLUSTERDOWN`, `TRYAGAIN` | refresh topology, retry                        |
//! | connection error          | retry the same node once, then refresh         |
//! | anything else             | return immediately                             |
//!
//! Every attempt counts against the configured maximum. Once it is reached
//! the last cause is returned inside [`Error::CommandFailed`].

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::cluster::address::Endpoint;
use crate::cluster::commands;
use crate::cluster::errors::parse_redis_error;
use crate::cluster::pool::ConnectionPool;
use crate::cluster::slot::key_slot;
use crate::cluster::topology::{ClusterTopology, TopologyTracker};
use crate::core::command::Cmd;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Routes commands to slot owners.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    tracker: Arc<TopologyTracker>,
    max_attempts: u32,
}

impl Dispatcher {
    /// Creates a dispatcher. `max_attempts` is clamped to at least one.
    pub fn new(pool: Arc<ConnectionPool>, tracker: Arc<TopologyTracker>, max_attempts: u32) -> Self {
        Self {
            pool,
            tracker,
            max_attempts: max_attempts.max(1),
        }
    }

    /// The slot every key of `cmd` hashes to, or `None` for keyless
    /// commands.
    ///
    /// # Errors
    ///
    /// [`Error::CrossSlot`] if the keys span several slots.
    pub fn command_slot(cmd: &Cmd) -> Result<Option<u16>> {
        let mut slots: Vec<u16> = cmd.keys().map(key_slot).collect();
        slots.sort_unstable();
        slots.dedup();
        match slots.as_slice() {
            [] => Ok(None),
            [slot] => Ok(Some(*slot)),
            _ => Err(Error::CrossSlot { slots }),
        }
    }

    /// Executes `cmd` on the node owning its keys.
    ///
    /// Keyless commands run on the first node of the current topology. A
    /// standalone server takes every command, so keys are not checked.
    #[instrument(
        level = "debug",
        skip(self, cmd),
        fields(command = %String::from_utf8_lossy(cmd.name()))
    )]
    pub async fn execute(&self, cmd: Cmd) -> Result<Frame> {
        let slot = if self.tracker.is_standalone() {
            None
        } else {
            Self::command_slot(&cmd)?
        };
        let frame = cmd.into_frame();

        let mut attempts = 0;
        let mut pinned: Option<(Endpoint, bool)> = None;
        let mut reconnected = false;
        loop {
            attempts += 1;
            let (version, endpoint, asking) = match pinned.take() {
                Some((endpoint, asking)) => (self.tracker.version(), endpoint, asking),
                None => {
                    let (version, endpoint) = self.locate(slot).await?;
                    (version, endpoint, false)
                }
            };

            let error = match self.attempt(&endpoint, &frame, asking).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            let retryable = error.is_redirect()
                || error.is_connection_error()
                || matches!(error, Error::ClusterDown | Error::TryAgain);
            if !retryable {
                return Err(error);
            }
            if attempts >= self.max_attempts {
                warn!(attempts, error = %error, "giving up");
                return Err(Error::CommandFailed {
                    attempts,
                    source: Box::new(error),
                });
            }

            match &error {
                Error::Ask { address, .. } => {
                    let target: Endpoint = address.parse()?;
                    debug!(%endpoint, %target, "ASK redirect");
                    pinned = Some((target, true));
                }
                Error::Moved { slot, address } => {
                    debug!(%endpoint, slot, %address, "MOVED redirect");
                    self.tracker.refresh_if_stale(version).await?;
                }
                Error::ClusterDown | Error::TryAgain => {
                    debug!(%endpoint, error = %error, "cluster busy");
                    self.tracker.refresh_if_stale(version).await?;
                }
                e if reconnected => {
                    warn!(%endpoint, error = %e, "node failed twice, refreshing topology");
                    reconnected = false;
                    self.tracker.refresh_if_stale(version).await?;
                }
                e => {
                    debug!(%endpoint, error = %e, "connection failed, retrying node");
                    reconnected = true;
                    pinned = Some((endpoint, asking));
                }
            }
        }
    }

    /// Sends `frame` once to `endpoint`, without any redirect handling.
    pub async fn execute_on(&self, endpoint: &Endpoint, frame: &Frame) -> Result<Frame> {
        self.attempt(endpoint, frame, false).await
    }

    async fn attempt(&self, endpoint: &Endpoint, frame: &Frame, asking: bool) -> Result<Frame> {
        let mut conn = self.pool.acquire(endpoint).await?;
        if asking {
            if let Frame::Error(e) = conn.request(&commands::asking().into_frame()).await? {
                return Err(parse_redis_error(&e));
            }
        }
        let reply = conn.request(frame).await?;
        conn.release();
        match reply {
            Frame::Error(e) => Err(parse_redis_error(&e)),
            reply => Ok(reply),
        }
    }

    async fn locate(&self, slot: Option<u16>) -> Result<(u64, Endpoint)> {
        let topology = self.tracker.snapshot();
        if let Some(endpoint) = route(&topology, slot) {
            return Ok((topology.version(), endpoint));
        }
        let topology = self.tracker.refresh_if_stale(topology.version()).await?;
        route(&topology, slot)
            .map(|endpoint| (topology.version(), endpoint))
            .ok_or(Error::TopologyUnavailable {
                attempted: self.tracker.seeds().len(),
            })
    }
}

fn route(topology: &ClusterTopology, slot: Option<u16>) -> Option<Endpoint> {
    match slot {
        Some(slot) => topology.node_for_slot(slot).cloned(),
        None => topology.endpoints().next().cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::pool::PoolConfig;
    use crate::core::command;
    use crate::core::config::ClientConfig;
    use crate::testing::MockCluster;
    use std::time::Duration;

    struct Harness {
        cluster: MockCluster,
        pool: Arc<ConnectionPool>,
        tracker: Arc<TopologyTracker>,
        dispatcher: Dispatcher,
    }

    async fn harness(nodes: usize, max_attempts: u32) -> Harness {
        let cluster = MockCluster::start(nodes).await;
        let config = cluster.client_config();
        harness_with(cluster, config, max_attempts).await
    }

    async fn harness_with(cluster: MockCluster, config: ClientConfig, max_attempts: u32) -> Harness {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from_client_config(&config)));
        let tracker = Arc::new(TopologyTracker::new(config.seeds().unwrap(), pool.clone()));
        tracker.refresh().await.unwrap();
        let dispatcher = Dispatcher::new(pool.clone(), tracker.clone(), max_attempts);
        Harness {
            cluster,
            pool,
            tracker,
            dispatcher,
        }
    }

    #[test]
    fn test_command_slot() {
        assert_eq!(Dispatcher::command_slot(&command::ping()).unwrap(), None);
        assert_eq!(
            Dispatcher::command_slot(&command::get("foo")).unwrap(),
            Some(12182)
        );
        assert_eq!(
            Dispatcher::command_slot(&command::del(["{u}a", "{u}b"])).unwrap(),
            Some(key_slot(b"u"))
        );
        match Dispatcher::command_slot(&command::del(["foo", "bar"])) {
            Err(Error::CrossSlot { slots }) => assert_eq!(slots, vec![5061, 12182]),
            other => panic!("Expected CrossSlot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cross_slot_fails_before_io() {
        let h = harness(3, 5).await;
        let err = h.dispatcher.execute(command::del(["foo", "bar"])).await.unwrap_err();
        assert!(matches!(err, Error::CrossSlot { .. }));
        assert_eq!(h.cluster.command_count("DEL"), 0);
    }

    #[tokio::test]
    async fn test_routes_to_slot_owner() {
        let h = harness(3, 5).await;
        for index in 0..3 {
            let key = h.cluster.key_on(index, "route:");
            let reply = h.dispatcher.execute(command::set(key.clone(), "v")).await.unwrap();
            assert_eq!(reply, Frame::simple("OK"));
        }
        assert_eq!(h.cluster.cluster_slots_calls(), 1);
        assert_eq!(h.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_keyless_command_goes_to_first_node() {
        let h = harness(3, 5).await;
        let reply = h.dispatcher.execute(command::ping()).await.unwrap();
        assert_eq!(reply, Frame::simple("PONG"));
        assert_eq!(h.cluster.connections_accepted(1), 0);
        assert_eq!(h.cluster.connections_accepted(2), 0);
    }

    #[tokio::test]
    async fn test_moved_refreshes_and_retries() {
        let h = harness(3, 5).await;
        let key = h.cluster.key_on(0, "moved:");
        h.cluster.insert_string(&key, "value");
        h.cluster.migrate_slot(key_slot(key.as_bytes()), 2);

        let reply = h.dispatcher.execute(command::get(key)).await.unwrap();
        assert_eq!(reply.as_bytes(), Some(&b"value"[..]));
        assert_eq!(h.tracker.version(), 2);
        assert_eq!(h.cluster.cluster_slots_calls(), 2);
        assert_eq!(h.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_moved_releases_connection_before_retry() {
        let cluster = MockCluster::start(3).await;
        let mut config = cluster.client_config();
        config.pool_size = 1;
        config.connect_timeout = Duration::from_millis(200);
        let h = harness_with(cluster, config, 5).await;

        let key = h.cluster.key_on(0, "moved:");
        h.cluster.insert_string(&key, "value");
        h.cluster.migrate_slot(key_slot(key.as_bytes()), 2);

        // The refresh goes back to node 0, whose only connection answered
        // MOVED. Holding it would time out the refresh.
        let reply = h.dispatcher.execute(command::get(key)).await.unwrap();
        assert_eq!(reply.as_bytes(), Some(&b"value"[..]));
        assert_eq!(h.tracker.version(), 2);
        assert_eq!(h.cluster.connections_accepted(0), 1);
        assert_eq!(h.pool.idle_count(&h.cluster.endpoint(0)).await, 1);
        assert_eq!(h.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_ask_retries_without_refresh() {
        let h = harness(3, 5).await;
        let key = h.cluster.key_on(1, "ask:");
        h.cluster.insert_string(&key, "value");
        h.cluster.ask_once(key_slot(key.as_bytes()), 2);

        let reply = h.dispatcher.execute(command::get(key)).await.unwrap();
        assert_eq!(reply.as_bytes(), Some(&b"value"[..]));
        assert_eq!(h.cluster.command_count("ASKING"), 1);
        assert_eq!(h.cluster.cluster_slots_calls(), 1);
        assert_eq!(h.tracker.version(), 1);
    }

    #[tokio::test]
    async fn test_cluster_down_refreshes_and_retries() {
        let h = harness(2, 5).await;
        h.cluster.cluster_down(2);
        let reply = h.dispatcher.execute(command::set("k", "v")).await.unwrap();
        assert_eq!(reply, Frame::simple("OK"));
        assert_eq!(h.cluster.cluster_slots_calls(), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_capped() {
        let h = harness(2, 3).await;
        h.cluster.cluster_down(10);
        match h.dispatcher.execute(command::get("k")).await {
            Err(Error::CommandFailed { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::ClusterDown));
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
        assert_eq!(h.cluster.command_count("GET"), 3);
        assert_eq!(h.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let h = harness(1, 5).await;
        h.cluster.insert_string("plain", "v");
        match h.dispatcher.execute(command::hgetall("plain")).await {
            Err(Error::Server { message }) => assert!(message.starts_with("WRONGTYPE")),
            other => panic!("Expected Server error, got {:?}", other),
        }
        assert_eq!(h.cluster.command_count("HGETALL"), 1);
    }

    #[tokio::test]
    async fn test_dead_owner_exhausts_attempts() {
        let h = harness(3, 4).await;
        let key = h.cluster.key_on(1, "dead:");
        h.cluster.kill_node(1);

        match h.dispatcher.execute(command::get(key)).await {
            Err(Error::CommandFailed { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(source.is_connection_error());
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
        assert_eq!(h.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_ends_with_topology_error() {
        let h = harness(2, 5).await;
        h.cluster.kill_node(0);
        h.cluster.kill_node(1);

        let err = h.dispatcher.execute(command::get("k")).await.unwrap_err();
        assert!(matches!(err, Error::TopologyUnavailable { attempted: 2 }));
        assert_eq!(h.pool.outstanding(), 0);
    }
}
