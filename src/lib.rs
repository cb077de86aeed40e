//! # Shardis
//!
//! Cluster-aware key-value client for service registries: slot routing with
//! redirect handling, per-node connection pools, cluster-wide pattern scans
//! and a pattern pub/sub relay.
//!
//! ## Features
//!
//! - `test-utils` - In-process mock cluster ([`testing::MockCluster`])
//!
//! ## Example
//!
//! ```no_run
//! use shardis::{ClientConfig, ClusterClient, KvClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_url("redis://127.0.0.1:7000?backup=127.0.0.1:7001")?;
//!     let client = ClusterClient::connect(config).await?;
//!     client.hset("registry:providers", "10.0.0.5:20880", "1").await?;
//!     let keys = client.scan("registry:*").await?.into_keys();
//!     println!("{:?}", keys);
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod core;
pub mod proto;

#[cfg(test)]
mod stress;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export high-level client types for convenience
pub use crate::cluster::address::Endpoint;
pub use crate::cluster::pubsub::{Message, MessageListener, PubSubEvent, PublishOutcome, Subscription};
pub use crate::cluster::scan::ScanOutcome;
pub use crate::cluster::{key_slot, ClusterClient};
pub use crate::core::builder::ClientBuilder;
pub use crate::core::capability::KvClient;
pub use crate::core::command::Cmd;
pub use crate::core::config::{ClientConfig, Credential};
pub use crate::core::{Client, Error, Result};
