//! Pattern subscriptions across all nodes.
//!
//! A subscription holds one dedicated connection per node, each read by its
//! own relay task, so a slow listener on one node never holds up another.
//! Messages keep their arrival order per node connection only.
//!
//! A node connection that drops is not reconnected. The listener hears about
//! it through [`MessageListener::on_disconnect`] and the subscription turns
//! inactive while the remaining nodes keep delivering.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::address::Endpoint;
use crate::cluster::dispatcher::Dispatcher;
use crate::cluster::pool::ConnectionPool;
use crate::cluster::topology::{ClusterTopology, TopologyTracker};
use crate::core::command;
use crate::core::connection::Connection;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A message delivered through a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The pattern that matched.
    pub pattern: String,
    /// The channel it was published on.
    pub channel: String,
    /// The published payload.
    pub payload: Bytes,
    /// The node whose connection delivered it.
    pub node: Endpoint,
}

/// Receives subscription traffic. Called from the relay task of the node
/// that delivered the message.
///
/// Callbacks run inline on that task and must not block: a blocking listener
/// holds a runtime worker, and on a `current_thread` runtime it stalls the
/// relays of every other node too. Hand slow work off to a channel or
/// [`tokio::task::spawn_blocking`]. The
/// [`UnboundedSender<PubSubEvent>`](mpsc::UnboundedSender) implementation
/// never blocks.
pub trait MessageListener: Send + Sync + 'static {
    /// A message arrived.
    fn on_message(&self, message: Message);

    /// The connection to `node` failed. No more messages arrive from it.
    fn on_disconnect(&self, node: &Endpoint, error: &Error) {
        let _ = (node, error);
    }
}

/// Subscription traffic as values, for channel-based listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    /// A message arrived.
    Message(Message),
    /// A node connection was lost.
    Disconnected {
        /// The node that dropped.
        node: Endpoint,
        /// Why.
        error: String,
    },
}

impl MessageListener for mpsc::UnboundedSender<PubSubEvent> {
    fn on_message(&self, message: Message) {
        let _ = self.send(PubSubEvent::Message(message));
    }

    fn on_disconnect(&self, node: &Endpoint, error: &Error) {
        let _ = self.send(PubSubEvent::Disconnected {
            node: node.clone(),
            error: error.to_string(),
        });
    }
}

/// Result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// The node that accepted the publish.
    pub node: Endpoint,
    /// Subscribers that received it, as counted by that node.
    pub receivers: i64,
}

impl PublishOutcome {
    /// Number of nodes that accepted the publish. Always 1.
    pub fn accepted_nodes(&self) -> usize {
        1
    }
}

/// A live pattern subscription.
///
/// Dropping it stops the relays as [`close`](Self::close) does, without
/// waiting for them.
pub struct Subscription {
    patterns: Vec<String>,
    nodes: Vec<Endpoint>,
    active: Arc<AtomicBool>,
    closed: AtomicBool,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscription {
    /// The subscribed patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// The nodes subscribed at creation.
    pub fn nodes(&self) -> &[Endpoint] {
        &self.nodes
    }

    /// False once any node connection dropped or the subscription closed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Unsubscribes on every node and closes the connections. Failures are
    /// logged and do not stop the other nodes. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.active.store(false, Ordering::Release);
        self.stop.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for joined in future::join_all(tasks).await {
            if let Err(e) = joined {
                warn!(error = %e, "relay task failed");
            }
        }
        info!(patterns = ?self.patterns, "subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("patterns", &self.patterns)
            .field("nodes", &self.nodes)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Opens subscriptions and publishes.
#[derive(Debug, Clone)]
pub struct PubSubRelay {
    pool: Arc<ConnectionPool>,
    tracker: Arc<TopologyTracker>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl PubSubRelay {
    /// Creates a relay. Cancelling `shutdown` closes every subscription it
    /// opened.
    pub fn new(
        pool: Arc<ConnectionPool>,
        tracker: Arc<TopologyTracker>,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            tracker,
            dispatcher,
            shutdown,
        }
    }

    async fn topology(&self) -> Result<Arc<ClusterTopology>> {
        let topology = self.tracker.snapshot();
        if topology.is_empty() {
            return self.tracker.refresh_if_stale(topology.version()).await;
        }
        Ok(topology)
    }

    /// Subscribes `listener` to `patterns` on every known node.
    ///
    /// Cancelling `cancel` closes the subscription.
    ///
    /// # Errors
    ///
    /// If any node cannot be subscribed; connections already opened are
    /// closed first.
    #[instrument(level = "debug", skip(self, listener, cancel))]
    pub async fn psubscribe(
        &self,
        patterns: Vec<String>,
        listener: Arc<dyn MessageListener>,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        if patterns.is_empty() {
            return Err(Error::InvalidArgument {
                message: "at least one pattern is required".to_string(),
            });
        }
        let topology = self.topology().await?;
        let nodes: Vec<Endpoint> = topology.endpoints().cloned().collect();
        let deadline = self.pool.config().connect.connect_timeout;

        let opened =
            future::join_all(nodes.iter().map(|node| self.open(node, &patterns, deadline))).await;
        let mut connections = Vec::with_capacity(nodes.len());
        let mut failure = None;
        for (node, result) in nodes.iter().zip(opened) {
            match result {
                Ok(conn) => connections.push((node.clone(), conn)),
                Err(e) => {
                    warn!(%node, error = %e, "subscribe failed");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            let closing = connections
                .into_iter()
                .map(|(node, conn)| unsubscribe(node, conn, &patterns, deadline));
            future::join_all(closing).await;
            return Err(e);
        }

        let stop = self.shutdown.child_token();
        let active = Arc::new(AtomicBool::new(true));
        let tasks = connections
            .into_iter()
            .map(|(node, conn)| {
                tokio::spawn(relay(RelayTask {
                    node,
                    conn,
                    patterns: patterns.clone(),
                    listener: listener.clone(),
                    stop: stop.clone(),
                    cancel: cancel.clone(),
                    active: active.clone(),
                    deadline,
                }))
            })
            .collect();

        info!(patterns = ?patterns, nodes = nodes.len(), "subscribed");
        Ok(Subscription {
            patterns,
            nodes,
            active,
            closed: AtomicBool::new(false),
            stop,
            tasks: Mutex::new(tasks),
        })
    }

    async fn open(
        &self,
        node: &Endpoint,
        patterns: &[String],
        deadline: Duration,
    ) -> Result<Connection<TcpStream>> {
        let mut conn = self.pool.connect_dedicated(node).await?;
        conn.write_frame(&command::psubscribe(patterns.iter().cloned()).into_frame())
            .await?;
        for _ in patterns {
            let ack = tokio::time::timeout(deadline, conn.read_frame())
                .await
                .map_err(|_| Error::Timeout {
                    operation: "waiting for PSUBSCRIBE confirmation",
                    after: deadline,
                })??;
            check_ack(ack)?;
        }
        debug!(%node, "subscribed node");
        Ok(conn)
    }

    /// Publishes `message` through the first node that accepts it.
    ///
    /// # Errors
    ///
    /// [`Error::CommandFailed`] with the last cause if every node failed.
    #[instrument(level = "debug", skip(self, message))]
    pub async fn publish(&self, channel: &str, message: Bytes) -> Result<PublishOutcome> {
        let topology = self.topology().await?;
        let frame = command::publish(channel.to_string(), message).into_frame();

        let mut attempts = 0;
        let mut last = None;
        for node in topology.endpoints() {
            attempts += 1;
            let reply = self.dispatcher.execute_on(node, &frame).await;
            match reply.and_then(command::frame_to_int) {
                Ok(receivers) => {
                    return Ok(PublishOutcome {
                        node: node.clone(),
                        receivers,
                    })
                }
                Err(e) => {
                    debug!(%node, error = %e, "publish failed, trying next node");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(Error::CommandFailed {
                attempts,
                source: Box::new(e),
            }),
            None => Err(Error::TopologyUnavailable { attempted: 0 }),
        }
    }
}

fn check_ack(ack: Frame) -> Result<()> {
    match ack {
        Frame::Array(parts) if parts.first().and_then(Frame::as_str) == Some("psubscribe") => Ok(()),
        Frame::Error(e) => Err(Error::Server {
            message: String::from_utf8_lossy(&e).into_owned(),
        }),
        other => Err(Error::Protocol {
            message: format!("unexpected PSUBSCRIBE confirmation {:?}", other),
        }),
    }
}

/// Extracts a `pmessage` push.
fn parse_push(frame: Frame, node: &Endpoint) -> Option<Message> {
    let Frame::Array(parts) = frame else {
        return None;
    };
    let [kind, pattern, channel, payload] = <[Frame; 4]>::try_from(parts).ok()?;
    if kind.as_str()? != "pmessage" {
        return None;
    }
    Some(Message {
        pattern: pattern.as_str()?.to_string(),
        channel: channel.as_str()?.to_string(),
        payload: match payload {
            Frame::BulkString(Some(data)) => data,
            _ => return None,
        },
        node: node.clone(),
    })
}

struct RelayTask {
    node: Endpoint,
    conn: Connection<TcpStream>,
    patterns: Vec<String>,
    listener: Arc<dyn MessageListener>,
    stop: CancellationToken,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
    deadline: Duration,
}

async fn relay(mut task: RelayTask) {
    let lost = loop {
        let frame = tokio::select! {
            biased;
            _ = task.stop.cancelled() => break None,
            _ = task.cancel.cancelled() => break None,
            frame = task.conn.read_frame() => frame,
        };
        match frame {
            Ok(frame) => match parse_push(frame, &task.node) {
                Some(message) => task.listener.on_message(message),
                None => debug!(node = %task.node, "ignoring subscription reply"),
            },
            Err(e) => break Some(e),
        }
    };

    task.active.store(false, Ordering::Release);
    match lost {
        Some(error) => {
            warn!(node = %task.node, error = %error, "subscription connection lost");
            task.listener.on_disconnect(&task.node, &error);
        }
        None => unsubscribe(task.node, task.conn, &task.patterns, task.deadline).await,
    }
}

async fn unsubscribe(
    node: Endpoint,
    mut conn: Connection<TcpStream>,
    patterns: &[String],
    deadline: Duration,
) {
    let frame = command::punsubscribe(patterns.iter().cloned()).into_frame();
    match tokio::time::timeout(deadline, conn.write_frame(&frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%node, error = %e, "PUNSUBSCRIBE failed"),
        Err(_) => warn!(%node, "PUNSUBSCRIBE timed out"),
    }
    if let Err(e) = conn.shutdown().await {
        debug!(%node, error = %e, "shutdown failed");
    }
    debug!(%node, "unsubscribed node");
}
