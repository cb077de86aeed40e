//! Cluster-wide `SCAN`.
//!
//! `SCAN` only walks the keyspace of the node it is sent to, so a cluster
//! scan keeps one cursor per node and runs rounds until every node's cursor
//! has come back to `"0"`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cluster::address::Endpoint;
use crate::cluster::dispatcher::Dispatcher;
use crate::cluster::topology::TopologyTracker;
use crate::core::command;
use crate::proto::error::Result;

/// `COUNT` hint sent with every `SCAN`.
pub const SCAN_COUNT: usize = 100;
/// Nodes scanned concurrently within one round.
pub const SCAN_PARALLELISM: usize = 4;

const START: &str = "0";

/// Result of a cluster-wide scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Matched keys, deduplicated.
    pub keys: HashSet<String>,
    /// False if a node failed or the scan was cancelled.
    pub complete: bool,
    /// Nodes whose scan failed; their keys are partial.
    pub failed_nodes: Vec<Endpoint>,
}

impl ScanOutcome {
    /// Consumes the outcome, keeping only the keys.
    pub fn into_keys(self) -> HashSet<String> {
        self.keys
    }
}

/// Per-node cursors of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanCursor {
    per_node: HashMap<Endpoint, String>,
    exhausted: HashSet<Endpoint>,
}

impl ScanCursor {
    /// Starts a cursor on each of `endpoints`.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            per_node: endpoints
                .into_iter()
                .map(|endpoint| (endpoint, START.to_string()))
                .collect(),
            exhausted: HashSet::new(),
        }
    }

    /// Nodes still to scan with their current cursor, in endpoint order.
    pub fn pending(&self) -> Vec<(Endpoint, String)> {
        let mut pending: Vec<_> = self
            .per_node
            .iter()
            .filter(|(endpoint, _)| !self.exhausted.contains(*endpoint))
            .map(|(endpoint, cursor)| (endpoint.clone(), cursor.clone()))
            .collect();
        pending.sort();
        pending
    }

    /// Records the cursor a node returned. `"0"` finishes the node.
    pub fn advance(&mut self, endpoint: &Endpoint, next: String) {
        if next == START {
            self.exhausted.insert(endpoint.clone());
        }
        if let Some(cursor) = self.per_node.get_mut(endpoint) {
            *cursor = next;
        }
    }

    /// Marks a node finished regardless of its cursor.
    pub fn exhaust(&mut self, endpoint: &Endpoint) {
        self.exhausted.insert(endpoint.clone());
    }

    /// Returns true once every node is finished.
    pub fn is_exhausted(&self) -> bool {
        self.per_node.keys().all(|e| self.exhausted.contains(e))
    }
}

/// Runs pattern scans over every node of the cluster.
#[derive(Debug, Clone)]
pub struct ScanAggregator {
    dispatcher: Dispatcher,
    tracker: Arc<TopologyTracker>,
    parallelism: usize,
    count: usize,
}

impl ScanAggregator {
    /// Creates an aggregator with the default batch size and parallelism.
    pub fn new(dispatcher: Dispatcher, tracker: Arc<TopologyTracker>) -> Self {
        Self {
            dispatcher,
            tracker,
            parallelism: SCAN_PARALLELISM,
            count: SCAN_COUNT,
        }
    }

    /// Collects every key matching `pattern` on the nodes known now.
    ///
    /// A node that fails keeps the keys it already returned and is reported
    /// in [`ScanOutcome::failed_nodes`]. Cancelling `cancel` stops further
    /// rounds and returns what was gathered so far.
    ///
    /// # Errors
    ///
    /// Only if the topology has never been loaded and cannot be.
    #[instrument(level = "debug", skip(self, cancel))]
    pub async fn scan(&self, pattern: &str, cancel: &CancellationToken) -> Result<ScanOutcome> {
        let mut topology = self.tracker.snapshot();
        if topology.is_empty() {
            topology = self.tracker.refresh_if_stale(topology.version()).await?;
        }
        let mut cursor = ScanCursor::new(topology.endpoints().cloned());
        let mut outcome = ScanOutcome {
            complete: true,
            ..ScanOutcome::default()
        };

        let mut rounds = 0usize;
        loop {
            self.drop_departed(&mut cursor);
            if cursor.is_exhausted() {
                break;
            }
            let round = stream::iter(cursor.pending())
                .map(|(endpoint, token)| async move {
                    let page = self.scan_page(&endpoint, &token, pattern).await;
                    (endpoint, page)
                })
                .buffer_unordered(self.parallelism)
                .collect::<Vec<_>>();

            let pages = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(rounds, "scan cancelled");
                    outcome.complete = false;
                    break;
                }
                pages = round => pages,
            };
            rounds += 1;

            for (endpoint, page) in pages {
                match page {
                    Ok((next, keys)) => {
                        outcome.keys.extend(keys);
                        cursor.advance(&endpoint, next);
                    }
                    Err(e) => {
                        warn!(%endpoint, error = %e, "scan failed on node, keeping partial keys");
                        cursor.exhaust(&endpoint);
                        outcome.complete = false;
                        outcome.failed_nodes.push(endpoint);
                    }
                }
            }
        }

        debug!(rounds, keys = outcome.keys.len(), complete = outcome.complete, "scan finished");
        Ok(outcome)
    }

    /// Finishes the cursor of every node the current topology no longer
    /// lists. Keys it already returned are kept.
    fn drop_departed(&self, cursor: &mut ScanCursor) {
        let topology = self.tracker.snapshot();
        let members: HashSet<&Endpoint> = topology.endpoints().collect();
        for (endpoint, _) in cursor.pending() {
            if !members.contains(&endpoint) {
                debug!(%endpoint, "node left the cluster, ending its scan");
                cursor.exhaust(&endpoint);
            }
        }
    }

    async fn scan_page(
        &self,
        endpoint: &Endpoint,
        cursor: &str,
        pattern: &str,
    ) -> Result<(String, Vec<String>)> {
        let frame = command::scan(cursor.to_string(), pattern.to_string(), self.count).into_frame();
        let reply = self.dispatcher.execute_on(endpoint, &frame).await?;
        command::frame_to_scan_response(reply)
    }
}
