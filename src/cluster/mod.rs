//! # Cluster
//!
//! Sharded cluster support: slot-based routing, topology discovery through
//! `CLUSTER SLOTS`, redirect handling (`MOVED`/`ASK`), per-node connection
//! pools, cluster-wide scans and the pub/sub relay.
//!
//! ## Components
//!
//! - [`address`] - Seed endpoint parsing
//! - [`pool`] - Bounded per-node connection pools
//! - [`topology`] - Slot map snapshots and refresh
//! - [`dispatcher`] - Routing and retries for single commands
//! - [`scan`] - Cluster-wide `SCAN`
//! - [`pubsub`] - Pattern subscriptions and publish
//!
//! ## Hash tags
//!
//! Keys sharing a `{tag}` hash to the same slot and can be used together in
//! multi-key commands:
//!
//! ```
//! use shardis::key_slot;
//!
//! assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
//! ```

pub mod address;
pub(crate) mod client;
pub mod commands;
pub mod dispatcher;
mod errors;
pub mod pool;
pub mod pubsub;
pub mod scan;
mod slot;
pub mod topology;

pub use client::ClusterClient;
pub use slot::{key_slot, SLOT_COUNT};
