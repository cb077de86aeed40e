//! Cluster topology snapshots and the tracker that keeps them current.
//!
//! A [`ClusterTopology`] is an immutable slot map built from one
//! `CLUSTER SLOTS` reply. The [`TopologyTracker`] publishes the current
//! snapshot through an [`ArcSwap`], so command paths read it without locking
//! while a refresh builds its replacement.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::address::Endpoint;
use crate::cluster::commands;
use crate::cluster::pool::ConnectionPool;
use crate::cluster::slot::{key_slot, SLOT_COUNT};
use crate::core::command;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// One inclusive slot range and the master serving it.
pub type SlotAssignment = (u16, u16, Endpoint);

/// A master node and the slot ranges it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    endpoint: Endpoint,
    slot_ranges: Vec<(u16, u16)>,
}

impl Node {
    /// The node address, which also keys its connection pool.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Inclusive slot ranges, ascending.
    pub fn slot_ranges(&self) -> &[(u16, u16)] {
        &self.slot_ranges
    }

    /// Number of slots served.
    pub fn slot_count(&self) -> usize {
        self.slot_ranges
            .iter()
            .map(|&(start, end)| (end - start) as usize + 1)
            .sum()
    }
}

/// An immutable slot map.
///
/// Once `version > 0` every slot maps to exactly one node.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    nodes: Vec<Node>,
    slot_table: Vec<usize>,
    version: u64,
}

impl ClusterTopology {
    /// The topology before the first successful refresh: no nodes, version 0.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            slot_table: Vec::new(),
            version: 0,
        }
    }

    /// Builds a topology from slot assignments.
    ///
    /// Nodes are ordered by the lowest slot they serve.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the ranges leave a gap, overlap, or run past the
    /// last slot.
    pub fn from_slot_ranges(version: u64, mut ranges: Vec<SlotAssignment>) -> Result<Self> {
        ranges.sort_by_key(|&(start, _, _)| start);

        let mut nodes: Vec<Node> = Vec::new();
        let mut slot_table = Vec::with_capacity(SLOT_COUNT as usize);
        let mut next: u32 = 0;
        for (start, end, endpoint) in ranges {
            if start > end || end >= SLOT_COUNT {
                return Err(invalid_map(format!("invalid slot range {}-{}", start, end)));
            }
            match (start as u32).cmp(&next) {
                std::cmp::Ordering::Greater => {
                    return Err(invalid_map(format!("slots {}-{} are not served", next, start - 1)))
                }
                std::cmp::Ordering::Less => {
                    return Err(invalid_map(format!("slot {} is assigned twice", start)))
                }
                std::cmp::Ordering::Equal => {}
            }

            let index = match nodes.iter().position(|n| n.endpoint == endpoint) {
                Some(index) => index,
                None => {
                    nodes.push(Node {
                        endpoint,
                        slot_ranges: Vec::new(),
                    });
                    nodes.len() - 1
                }
            };
            nodes[index].slot_ranges.push((start, end));
            slot_table.extend(std::iter::repeat(index).take((end - start) as usize + 1));
            next = end as u32 + 1;
        }
        if next != SLOT_COUNT as u32 {
            return Err(invalid_map(format!(
                "slots {}-{} are not served",
                next,
                SLOT_COUNT - 1
            )));
        }

        Ok(Self {
            nodes,
            slot_table,
            version,
        })
    }

    /// Monotonic version, bumped by every successful refresh.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Known master nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Endpoints of the known master nodes, in slot order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> + '_ {
        self.nodes.iter().map(Node::endpoint)
    }

    /// The node serving `slot`, or `None` before the first refresh.
    pub fn node_for_slot(&self, slot: u16) -> Option<&Endpoint> {
        let index = *self.slot_table.get(slot as usize)?;
        self.nodes.get(index).map(Node::endpoint)
    }

    /// Returns true if the topology has not been loaded yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self::empty()
    }
}

fn invalid_map(message: String) -> Error {
    Error::Protocol {
        message: format!("CLUSTER SLOTS: {}", message),
    }
}

/// Parses a `CLUSTER SLOTS` reply into master slot assignments.
///
/// Replica entries are ignored. An empty host means the node that was
/// queried.
pub fn parse_cluster_slots(frame: Frame, queried: &Endpoint) -> Result<Vec<SlotAssignment>> {
    let entries = match frame {
        Frame::Array(entries) => entries,
        _ => return Err(invalid_map("response must be an array".to_string())),
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = match entry {
            Frame::Array(fields) if fields.len() >= 3 => fields,
            _ => return Err(invalid_map("range entry must be an array of at least 3".to_string())),
        };
        let start = slot_number(&fields[0])?;
        let end = slot_number(&fields[1])?;
        let master = parse_node(&fields[2], queried)?;
        ranges.push((start, end, master));
    }
    Ok(ranges)
}

fn slot_number(frame: &Frame) -> Result<u16> {
    match frame {
        Frame::Integer(n) if (0..SLOT_COUNT as i64).contains(n) => Ok(*n as u16),
        other => Err(invalid_map(format!("invalid slot number {:?}", other))),
    }
}

fn parse_node(frame: &Frame, queried: &Endpoint) -> Result<Endpoint> {
    let fields = match frame {
        Frame::Array(fields) if fields.len() >= 2 => fields,
        _ => return Err(invalid_map("node must be an array of at least 2".to_string())),
    };
    let host = match &fields[0] {
        Frame::BulkString(Some(data)) => String::from_utf8_lossy(data).into_owned(),
        Frame::BulkString(None) | Frame::Null => String::new(),
        _ => return Err(invalid_map("node host must be a bulk string".to_string())),
    };
    let port = match &fields[1] {
        Frame::Integer(n) if (1..=u16::MAX as i64).contains(n) => *n as u16,
        other => return Err(invalid_map(format!("invalid node port {:?}", other))),
    };
    if host.is_empty() || host == "?" {
        return Ok(Endpoint::new(queried.host(), port));
    }
    Ok(Endpoint::new(host, port))
}

/// Where slot maps come from.
#[derive(Debug, Clone)]
enum Discovery {
    /// `CLUSTER SLOTS` from the known nodes, then these seeds.
    Cluster(Vec<Endpoint>),
    /// A single server owning every slot.
    Standalone(Endpoint),
}

/// Owns the current topology snapshot and refreshes it on demand.
#[derive(Debug)]
pub struct TopologyTracker {
    discovery: Discovery,
    current: ArcSwap<ClusterTopology>,
    pool: Arc<ConnectionPool>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
}

impl TopologyTracker {
    /// Creates a tracker with an empty topology. Call
    /// [`refresh`](Self::refresh) before routing.
    pub fn new(seeds: Vec<Endpoint>, pool: Arc<ConnectionPool>) -> Self {
        Self::with_discovery(Discovery::Cluster(seeds), pool)
    }

    /// Creates a tracker for a single non-clustered server. Refreshing only
    /// checks that the server answers `PING`.
    pub fn standalone(endpoint: Endpoint, pool: Arc<ConnectionPool>) -> Self {
        Self::with_discovery(Discovery::Standalone(endpoint), pool)
    }

    fn with_discovery(discovery: Discovery, pool: Arc<ConnectionPool>) -> Self {
        Self {
            discovery,
            current: ArcSwap::from_pointee(ClusterTopology::empty()),
            pool,
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// The seed endpoints.
    pub fn seeds(&self) -> &[Endpoint] {
        match &self.discovery {
            Discovery::Cluster(seeds) => seeds,
            Discovery::Standalone(endpoint) => std::slice::from_ref(endpoint),
        }
    }

    /// Returns true when tracking a single non-clustered server.
    pub fn is_standalone(&self) -> bool {
        matches!(self.discovery, Discovery::Standalone(_))
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ClusterTopology> {
        self.current.load_full()
    }

    /// The current topology version.
    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Number of successful refreshes.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Maps `key` to its slot owner, returning the topology version that
    /// produced the answer.
    pub fn resolve(&self, key: &[u8]) -> Option<(u64, Endpoint)> {
        self.resolve_slot(key_slot(key))
    }

    /// Maps a slot to its owner.
    pub fn resolve_slot(&self, slot: u16) -> Option<(u64, Endpoint)> {
        let topology = self.current.load();
        topology
            .node_for_slot(slot)
            .map(|endpoint| (topology.version(), endpoint.clone()))
    }

    /// Reloads the slot map unconditionally.
    pub async fn refresh(&self) -> Result<Arc<ClusterTopology>> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Reloads the slot map unless another caller already replaced the
    /// version `seen_version` this caller found stale.
    pub async fn refresh_if_stale(&self, seen_version: u64) -> Result<Arc<ClusterTopology>> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.snapshot();
        if current.version() > seen_version {
            debug!(
                seen_version,
                version = current.version(),
                "topology already refreshed"
            );
            return Ok(current);
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<Arc<ClusterTopology>> {
        let previous = self.snapshot();
        if let Discovery::Standalone(endpoint) = &self.discovery {
            return self.refresh_standalone(&previous, endpoint).await;
        }
        let mut candidates: Vec<Endpoint> = previous.endpoints().cloned().collect();
        for seed in self.seeds() {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        for endpoint in &candidates {
            let ranges = match self.fetch_slots(endpoint).await {
                Ok(ranges) => ranges,
                Err(e) => {
                    warn!(%endpoint, error = %e, "CLUSTER SLOTS failed");
                    continue;
                }
            };
            match ClusterTopology::from_slot_ranges(previous.version() + 1, ranges) {
                Ok(topology) => return Ok(self.install(&previous, topology).await),
                Err(e) => warn!(%endpoint, error = %e, "rejected slot map"),
            }
        }
        Err(Error::TopologyUnavailable {
            attempted: candidates.len(),
        })
    }

    async fn refresh_standalone(
        &self,
        previous: &ClusterTopology,
        endpoint: &Endpoint,
    ) -> Result<Arc<ClusterTopology>> {
        let ping = async {
            let mut conn = self.pool.acquire(endpoint).await?;
            let reply = conn.request(&command::ping().into_frame()).await?;
            command::parse_frame_response(reply)
        };
        if let Err(e) = ping.await {
            warn!(%endpoint, error = %e, "server did not answer PING");
            return Err(Error::TopologyUnavailable { attempted: 1 });
        }
        let ranges = vec![(0, SLOT_COUNT - 1, endpoint.clone())];
        let topology = ClusterTopology::from_slot_ranges(previous.version() + 1, ranges)?;
        Ok(self.install(previous, topology).await)
    }

    async fn fetch_slots(&self, endpoint: &Endpoint) -> Result<Vec<SlotAssignment>> {
        let mut conn = self.pool.acquire(endpoint).await?;
        let reply = conn.request(&commands::cluster_slots().into_frame()).await?;
        conn.release();
        parse_cluster_slots(command::parse_frame_response(reply)?, endpoint)
    }

    async fn install(
        &self,
        previous: &ClusterTopology,
        topology: ClusterTopology,
    ) -> Arc<ClusterTopology> {
        let topology = Arc::new(topology);
        self.current.store(topology.clone());
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        // Includes pools re-created by callers routing on a stale snapshot.
        let known: HashSet<&Endpoint> = topology.endpoints().collect();
        let removed: Vec<Endpoint> = self
            .pool
            .endpoints()
            .await
            .into_iter()
            .filter(|endpoint| !known.contains(endpoint))
            .collect();
        for endpoint in &removed {
            self.pool.evict(endpoint).await;
        }
        info!(
            version = topology.version(),
            previous = previous.version(),
            nodes = topology.nodes().len(),
            removed = removed.len(),
            "topology refreshed"
        );
        topology
    }
}
