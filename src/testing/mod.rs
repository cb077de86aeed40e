//! In-process mock cluster for tests.
//!
//! Every node is a small RESP server listening on `127.0.0.1:0`. Nodes share
//! one keyspace; a key lives on the node that owns its slot and keyed
//! commands sent anywhere else are answered with `MOVED`, just like a real
//! cluster. Faults can be injected per node.
//!
//! ```no_run
//! # async fn demo() -> shardis::Result<()> {
//! use shardis::testing::MockCluster;
//! use shardis::ClusterClient;
//!
//! let cluster = MockCluster::start(3).await;
//! let client = ClusterClient::connect(cluster.client_config()).await?;
//! client.set("greeting", "hello").await?;
//! assert_eq!(cluster.string_value("greeting").as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::address::Endpoint;
use crate::cluster::{key_slot, SLOT_COUNT};
use crate::core::config::ClientConfig;
use crate::proto::codec::{encode_frame, Decoder};
use crate::proto::frame::Frame;

/// Largest page a mock `SCAN` returns, whatever `COUNT` asks for.
pub const MAX_SCAN_PAGE: usize = 10;

/// A running mock cluster. Dropping it stops every node.
#[derive(Debug)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    nodes: Vec<NodeHandle>,
}

#[derive(Debug)]
struct NodeHandle {
    endpoint: Endpoint,
    shutdown: CancellationToken,
    accepted: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct Subscriber {
    conn_id: u64,
    patterns: Vec<Bytes>,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Debug, Default)]
struct State {
    endpoints: Vec<Endpoint>,
    owners: Vec<usize>,
    strings: HashMap<Bytes, Bytes>,
    hashes: HashMap<Bytes, HashMap<Bytes, Bytes>>,
    password: Option<String>,
    scan_budget: HashMap<usize, usize>,
    reply_delay: HashMap<usize, Duration>,
    pending_ask: Option<(u16, usize)>,
    cluster_down: usize,
    subscribers: Vec<Subscriber>,
    next_conn_id: u64,
    commands: HashMap<String, usize>,
    standalone: bool,
}

struct Session {
    node: usize,
    conn_id: u64,
    authenticated: bool,
    asking: bool,
    tx: mpsc::UnboundedSender<Frame>,
}

impl MockCluster {
    /// Starts `node_count` nodes with the slots split evenly between them,
    /// node 0 serving the lowest slots.
    ///
    /// # Panics
    ///
    /// If a listener cannot be bound.
    pub async fn start(node_count: usize) -> Self {
        Self::launch(node_count, false).await
    }

    /// Starts one node with cluster support disabled: `CLUSTER` commands
    /// fail and keys are never redirected or checked for slot spread.
    ///
    /// # Panics
    ///
    /// If the listener cannot be bound.
    pub async fn start_standalone() -> Self {
        Self::launch(1, true).await
    }

    async fn launch(node_count: usize, standalone: bool) -> Self {
        assert!(node_count > 0, "a cluster needs at least one node");
        let mut listeners = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind mock node");
            let port = listener.local_addr().expect("mock node address").port();
            listeners.push((listener, Endpoint::new("127.0.0.1", port)));
        }

        let owners = (0..SLOT_COUNT as usize)
            .map(|slot| slot * node_count / SLOT_COUNT as usize)
            .collect();
        let state = Arc::new(Mutex::new(State {
            endpoints: listeners.iter().map(|(_, e)| e.clone()).collect(),
            owners,
            standalone,
            ..State::default()
        }));

        let mut nodes = Vec::with_capacity(node_count);
        for (index, (listener, endpoint)) in listeners.into_iter().enumerate() {
            let shutdown = CancellationToken::new();
            let accepted = Arc::new(AtomicUsize::new(0));
            tokio::spawn(accept_loop(
                index,
                listener,
                state.clone(),
                shutdown.clone(),
                accepted.clone(),
            ));
            nodes.push(NodeHandle {
                endpoint,
                shutdown,
                accepted,
            });
        }
        Self { state, nodes }
    }

    /// Endpoint of node `index`.
    pub fn endpoint(&self, index: usize) -> Endpoint {
        self.nodes[index].endpoint.clone()
    }

    /// Endpoints of all nodes, in start order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.nodes.iter().map(|n| n.endpoint.clone()).collect()
    }

    /// A client configuration seeded with every node and short timeouts.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.endpoint(0));
        let backups: Vec<String> = self.nodes[1..]
            .iter()
            .map(|n| n.endpoint.to_string())
            .collect();
        if !backups.is_empty() {
            config.backup_addresses = Some(backups.join(","));
        }
        config.connect_timeout = Duration::from_millis(500);
        config.read_timeout = Duration::from_millis(500);
        config
    }

    /// Stops node `index`: its listener closes and open connections drop.
    pub fn kill_node(&self, index: usize) {
        self.nodes[index].shutdown.cancel();
    }

    /// Hands every slot of node `index` to another node, as if it left the
    /// cluster. The node keeps running.
    pub fn remove_node(&self, index: usize) {
        let mut state = self.state.lock();
        let heir = (0..state.endpoints.len())
            .find(|&i| i != index && state.owners.contains(&i))
            .expect("another node must own slots");
        for owner in state.owners.iter_mut() {
            if *owner == index {
                *owner = heir;
            }
        }
    }

    /// Reassigns `slot` to node `to`. The old owner answers `MOVED` from now
    /// on.
    pub fn migrate_slot(&self, slot: u16, to: usize) {
        self.state.lock().owners[slot as usize] = to;
    }

    /// Makes the owner of `slot` answer the next command for it with
    /// `ASK <slot> <node to>`. Node `to` serves it once after `ASKING`.
    pub fn ask_once(&self, slot: u16, to: usize) {
        self.state.lock().pending_ask = Some((slot, to));
    }

    /// Answers the next `times` keyed commands with `CLUSTERDOWN`.
    pub fn cluster_down(&self, times: usize) {
        self.state.lock().cluster_down = times;
    }

    /// Lets node `index` answer `pages` more `SCAN` calls, then fail every
    /// further one.
    pub fn fail_scan_after(&self, index: usize, pages: usize) {
        self.state.lock().scan_budget.insert(index, pages);
    }

    /// Delays every reply of node `index`.
    pub fn set_reply_delay(&self, index: usize, delay: Duration) {
        self.state.lock().reply_delay.insert(index, delay);
    }

    /// Requires `AUTH` with this password on every new connection.
    pub fn set_password(&self, password: Option<&str>) {
        self.state.lock().password = password.map(str::to_string);
    }

    /// Stores a string key directly.
    pub fn insert_string(&self, key: &str, value: &str) {
        self.state
            .lock()
            .strings
            .insert(Bytes::from(key.to_string()), Bytes::from(value.to_string()));
    }

    /// Reads a string key directly.
    pub fn string_value(&self, key: &str) -> Option<Bytes> {
        self.state.lock().strings.get(key.as_bytes()).cloned()
    }

    /// Reads a hash field directly.
    pub fn hash_field(&self, key: &str, field: &str) -> Option<Bytes> {
        self.state
            .lock()
            .hashes
            .get(key.as_bytes())
            .and_then(|h| h.get(field.as_bytes()))
            .cloned()
    }

    /// Index of the node that owns `key`.
    pub fn owner_index(&self, key: &[u8]) -> usize {
        self.state.lock().owners[key_slot(key) as usize]
    }

    /// Endpoint of the node that owns `key`.
    pub fn owner_of(&self, key: &[u8]) -> Endpoint {
        self.endpoint(self.owner_index(key))
    }

    /// The first key `prefix0`, `prefix1`, ... owned by node `index`.
    pub fn key_on(&self, index: usize, prefix: &str) -> String {
        self.keys_on(index, prefix, 1).remove(0)
    }

    /// The first `count` keys `prefix0`, `prefix1`, ... owned by node
    /// `index`.
    pub fn keys_on(&self, index: usize, prefix: &str, count: usize) -> Vec<String> {
        let state = self.state.lock();
        (0..)
            .map(|i| format!("{}{}", prefix, i))
            .filter(|key| state.owners[key_slot(key.as_bytes()) as usize] == index)
            .take(count)
            .collect()
    }

    /// Number of connections node `index` accepted.
    pub fn connections_accepted(&self, index: usize) -> usize {
        self.nodes[index].accepted.load(Ordering::SeqCst)
    }

    /// How often a command was received across all nodes.
    pub fn command_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .commands
            .get(&name.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// Number of `CLUSTER SLOTS` requests served.
    pub fn cluster_slots_calls(&self) -> usize {
        self.command_count("CLUSTER")
    }

    /// Number of open pattern subscriptions across all nodes.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|s| !s.patterns.is_empty())
            .count()
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown.cancel();
        }
    }
}

async fn accept_loop(
    node: usize,
    listener: TcpListener,
    state: Arc<Mutex<State>>,
    shutdown: CancellationToken,
    accepted: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = listener.accept() => match incoming {
                Ok((socket, _)) => {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(node, socket, state.clone(), shutdown.clone()));
                }
                Err(_) => break,
            },
        }
    }
}

async fn serve(node: usize, socket: TcpStream, state: Arc<Mutex<State>>, shutdown: CancellationToken) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_shutdown = shutdown.clone();
    let writer_task = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            let frame = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            buf.clear();
            encode_frame(&frame, &mut buf);
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let conn_id = {
        let mut state = state.lock();
        state.next_conn_id += 1;
        state.next_conn_id
    };
    let mut session = Session {
        node,
        conn_id,
        authenticated: false,
        asking: false,
        tx,
    };

    let mut decoder = Decoder::new();
    let mut chunk = vec![0u8; 4096];
    'read: loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        decoder.append(&chunk[..n]);
        loop {
            let frame = match decoder.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => break 'read,
            };
            let delay = state.lock().reply_delay.get(&node).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let replies = handle(&mut state.lock(), &mut session, frame);
            for reply in replies {
                if session.tx.send(reply).is_err() {
                    break 'read;
                }
            }
        }
    }

    state.lock().subscribers.retain(|s| s.conn_id != conn_id);
    drop(session);
    let _ = writer_task.await;
}

fn error(message: impl AsRef<str>) -> Frame {
    Frame::error(message)
}

fn ok() -> Frame {
    Frame::simple("OK")
}

fn handle(state: &mut State, session: &mut Session, frame: Frame) -> Vec<Frame> {
    let args: Vec<Bytes> = match frame {
        Frame::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Frame::BulkString(Some(b)) => Some(b),
                _ => None,
            })
            .collect(),
        _ => return vec![error("ERR Protocol error: expected array")],
    };
    let Some(first) = args.first() else {
        return vec![error("ERR empty command")];
    };
    let name = String::from_utf8_lossy(first).to_ascii_uppercase();
    *state.commands.entry(name.clone()).or_default() += 1;

    if name == "AUTH" {
        let given = args.last().map(|p| String::from_utf8_lossy(p).into_owned());
        return match (&state.password, given) {
            (Some(expected), Some(given)) if *expected == given && args.len() >= 2 => {
                session.authenticated = true;
                vec![ok()]
            }
            (None, _) => vec![error("ERR AUTH called without any password configured")],
            _ => vec![error("WRONGPASS invalid username-password pair")],
        };
    }
    if state.password.is_some() && !session.authenticated {
        return vec![error("NOAUTH Authentication required.")];
    }
    let asking = std::mem::take(&mut session.asking);

    match name.as_str() {
        "PING" => vec![Frame::simple("PONG")],
        "ASKING" => {
            session.asking = true;
            vec![ok()]
        }
        "CLUSTER" if state.standalone => {
            vec![error("ERR This instance has cluster support disabled")]
        }
        "CLUSTER" => match args.get(1) {
            Some(sub) if sub.eq_ignore_ascii_case(b"SLOTS") => vec![state.slots_reply()],
            _ => vec![error("ERR unknown CLUSTER subcommand")],
        },
        "SCAN" => vec![state.scan(session.node, &args[1..])],
        "PUBLISH" if args.len() == 3 => vec![state.publish(&args[1], &args[2])],
        "PSUBSCRIBE" if args.len() >= 2 => state.psubscribe(session, &args[1..]),
        "PUNSUBSCRIBE" => state.punsubscribe(session.conn_id, &args[1..]),
        "GET" | "SET" | "DEL" | "EXISTS" | "HSET" | "HGETALL" | "HDEL" if args.len() >= 2 => {
            if let Some(redirect) = state.route(session.node, &args[1..], &name, asking) {
                return vec![redirect];
            }
            vec![state.keyed(&name, &args[1..])]
        }
        "PUBLISH" | "PSUBSCRIBE" | "GET" | "SET" | "DEL" | "EXISTS" | "HSET" | "HGETALL"
        | "HDEL" => vec![error(format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        ))],
        _ => vec![error(format!("ERR unknown command '{}'", name))],
    }
}

impl State {
    fn slots_reply(&self) -> Frame {
        let mut entries = Vec::new();
        let mut start = 0usize;
        while start < self.owners.len() {
            let owner = self.owners[start];
            let mut end = start;
            while end + 1 < self.owners.len() && self.owners[end + 1] == owner {
                end += 1;
            }
            let endpoint = &self.endpoints[owner];
            entries.push(Frame::Array(vec![
                Frame::Integer(start as i64),
                Frame::Integer(end as i64),
                Frame::Array(vec![
                    Frame::bulk(endpoint.host().to_string()),
                    Frame::Integer(endpoint.port() as i64),
                    Frame::bulk(format!("mock-node-{}", owner)),
                ]),
            ]));
            start = end + 1;
        }
        Frame::Array(entries)
    }

    fn route(&mut self, node: usize, keys: &[Bytes], name: &str, asking: bool) -> Option<Frame> {
        if self.standalone {
            return None;
        }
        let key_count = match name {
            "DEL" | "EXISTS" => keys.len(),
            _ => 1,
        };
        let slot = key_slot(&keys[0]);
        if keys[..key_count].iter().any(|k| key_slot(k) != slot) {
            return Some(error("CROSSSLOT Keys in request don't hash to the same slot"));
        }
        if self.cluster_down > 0 {
            self.cluster_down -= 1;
            return Some(error("CLUSTERDOWN The cluster is down"));
        }
        let owner = self.owners[slot as usize];
        if let Some((ask_slot, target)) = self.pending_ask {
            if ask_slot == slot {
                if node == target && asking {
                    self.pending_ask = None;
                    return None;
                }
                if node == owner {
                    return Some(error(format!("ASK {} {}", slot, self.endpoints[target])));
                }
            }
        }
        if owner != node {
            return Some(error(format!("MOVED {} {}", slot, self.endpoints[owner])));
        }
        None
    }

    fn keyed(&mut self, name: &str, args: &[Bytes]) -> Frame {
        let key = &args[0];
        match (name, args.len()) {
            ("GET", 1) => match self.strings.get(key) {
                Some(value) => Frame::BulkString(Some(value.clone())),
                None if self.hashes.contains_key(key) => wrong_type(),
                None => Frame::BulkString(None),
            },
            ("SET", 2) => {
                self.hashes.remove(key);
                self.strings.insert(key.clone(), args[1].clone());
                ok()
            }
            ("DEL", _) => {
                let removed = args
                    .iter()
                    .filter(|k| self.strings.remove(*k).is_some() | self.hashes.remove(*k).is_some())
                    .count();
                Frame::Integer(removed as i64)
            }
            ("EXISTS", _) => {
                let found = args
                    .iter()
                    .filter(|k| self.strings.contains_key(*k) || self.hashes.contains_key(*k))
                    .count();
                Frame::Integer(found as i64)
            }
            ("HSET", n) if n >= 3 && n % 2 == 1 => {
                if self.strings.contains_key(key) {
                    return wrong_type();
                }
                let hash = self.hashes.entry(key.clone()).or_default();
                let added = args[1..]
                    .chunks(2)
                    .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                    .count();
                Frame::Integer(added as i64)
            }
            ("HGETALL", 1) => match self.hashes.get(key) {
                Some(hash) => Frame::Array(
                    hash.iter()
                        .flat_map(|(f, v)| [Frame::BulkString(Some(f.clone())), Frame::BulkString(Some(v.clone()))])
                        .collect(),
                ),
                None if self.strings.contains_key(key) => wrong_type(),
                None => Frame::Array(Vec::new()),
            },
            ("HDEL", n) if n >= 2 => {
                let Some(hash) = self.hashes.get_mut(key) else {
                    return Frame::Integer(0);
                };
                let removed = args[1..].iter().filter(|f| hash.remove(*f).is_some()).count();
                if hash.is_empty() {
                    self.hashes.remove(key);
                }
                Frame::Integer(removed as i64)
            }
            _ => error(format!(
                "ERR wrong number of arguments for '{}' command",
                name.to_ascii_lowercase()
            )),
        }
    }

    fn scan(&mut self, node: usize, args: &[Bytes]) -> Frame {
        if let Some(budget) = self.scan_budget.get_mut(&node) {
            if *budget == 0 {
                return error("ERR injected scan failure");
            }
            *budget -= 1;
        }
        let Some(cursor) = args
            .first()
            .and_then(|c| std::str::from_utf8(c).ok())
            .and_then(|c| c.parse::<usize>().ok())
        else {
            return error("ERR invalid cursor");
        };

        let mut pattern: Option<&[u8]> = None;
        let mut count = 10usize;
        for option in args[1..].chunks(2) {
            match option {
                [name, value] if name.eq_ignore_ascii_case(b"MATCH") => pattern = Some(value),
                [name, value] if name.eq_ignore_ascii_case(b"COUNT") => {
                    match std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
                        Some(c) if c > 0 => count = c,
                        _ => return error("ERR value is not an integer or out of range"),
                    }
                }
                _ => return error("ERR syntax error"),
            }
        }

        let owned: BTreeSet<&Bytes> = self
            .strings
            .keys()
            .chain(self.hashes.keys())
            .filter(|k| self.owners[key_slot(k) as usize] == node)
            .collect();
        let owned: Vec<&Bytes> = owned.into_iter().collect();
        let start = cursor.min(owned.len());
        let end = (start + count.min(MAX_SCAN_PAGE)).min(owned.len());
        let page = owned[start..end]
            .iter()
            .filter(|k| pattern.map_or(true, |p| glob_match(p, k)))
            .map(|k| Frame::BulkString(Some((*k).clone())))
            .collect();
        let next = if end >= owned.len() { 0 } else { end };
        Frame::Array(vec![Frame::bulk(next.to_string()), Frame::Array(page)])
    }

    fn publish(&mut self, channel: &Bytes, message: &Bytes) -> Frame {
        let mut receivers = 0;
        for subscriber in &self.subscribers {
            for pattern in &subscriber.patterns {
                if glob_match(pattern, channel) {
                    let delivered = subscriber.tx.send(Frame::Array(vec![
                        Frame::bulk("pmessage"),
                        Frame::BulkString(Some(pattern.clone())),
                        Frame::BulkString(Some(channel.clone())),
                        Frame::BulkString(Some(message.clone())),
                    ]));
                    if delivered.is_ok() {
                        receivers += 1;
                    }
                }
            }
        }
        Frame::Integer(receivers)
    }

    fn psubscribe(&mut self, session: &Session, patterns: &[Bytes]) -> Vec<Frame> {
        let index = match self.subscribers.iter().position(|s| s.conn_id == session.conn_id) {
            Some(index) => index,
            None => {
                self.subscribers.push(Subscriber {
                    conn_id: session.conn_id,
                    patterns: Vec::new(),
                    tx: session.tx.clone(),
                });
                self.subscribers.len() - 1
            }
        };
        let subscriber = &mut self.subscribers[index];
        patterns
            .iter()
            .map(|pattern| {
                if !subscriber.patterns.contains(pattern) {
                    subscriber.patterns.push(pattern.clone());
                }
                Frame::Array(vec![
                    Frame::bulk("psubscribe"),
                    Frame::BulkString(Some(pattern.clone())),
                    Frame::Integer(subscriber.patterns.len() as i64),
                ])
            })
            .collect()
    }

    fn punsubscribe(&mut self, conn_id: u64, patterns: &[Bytes]) -> Vec<Frame> {
        let Some(subscriber) = self.subscribers.iter_mut().find(|s| s.conn_id == conn_id) else {
            return vec![Frame::Array(vec![
                Frame::bulk("punsubscribe"),
                Frame::Null,
                Frame::Integer(0),
            ])];
        };
        let targets: Vec<Bytes> = if patterns.is_empty() {
            subscriber.patterns.clone()
        } else {
            patterns.to_vec()
        };
        targets
            .into_iter()
            .map(|pattern| {
                subscriber.patterns.retain(|p| *p != pattern);
                Frame::Array(vec![
                    Frame::bulk("punsubscribe"),
                    Frame::BulkString(Some(pattern)),
                    Frame::Integer(subscriber.patterns.len() as i64),
                ])
            })
            .collect()
    }
}

fn wrong_type() -> Frame {
    error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

/// Glob matching with `*`, `?`, `[...]` classes and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((star, consumed)) => {
                p = star + 1;
                t = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `c` against the class starting at `pattern[open] == b'['`.
/// Returns whether it matched and the index after the closing `]`.
fn match_class(pattern: &[u8], open: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        if pattern[i] == b'\\' && i + 1 < pattern.len() {
            matched |= pattern[i + 1] == c;
            i += 2;
        } else if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            let (lo, hi) = (pattern[i].min(pattern[i + 2]), pattern[i].max(pattern[i + 2]));
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= pattern[i] == c;
            i += 1;
        }
    }
    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
