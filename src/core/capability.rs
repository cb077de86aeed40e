//! The command surface shared by the cluster and standalone clients.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::cluster::pubsub::{MessageListener, PublishOutcome, Subscription};
use crate::cluster::scan::ScanOutcome;
use crate::core::command::{self, Cmd};
use crate::proto::error::Result;
use crate::proto::frame::Frame;

/// Operations every client offers.
///
/// Implementors provide the transport-level methods; the typed helpers are
/// built on [`execute`](Self::execute).
///
/// # Example
///
/// ```no_run
/// use shardis::{ClientConfig, ClusterClient, KvClient};
///
/// # async fn demo() -> shardis::Result<()> {
/// let config = ClientConfig::from_url("redis://10.0.0.1:7000?backup=10.0.0.2:7001")?;
/// let client = ClusterClient::connect(config).await?;
///
/// client.hset("registry:providers", "10.0.0.5:20880", "1").await?;
/// let providers = client.hgetall("registry:providers").await?;
/// assert!(providers.contains_key("10.0.0.5:20880"));
///
/// let outcome = client.scan("registry:*").await?;
/// if !outcome.complete {
///     // some node did not finish; the key set is partial
/// }
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub trait KvClient: Send + Sync {
    /// Sends a raw command and returns the reply frame.
    ///
    /// Error replies come back as `Err`.
    fn execute(&self, cmd: Cmd) -> impl Future<Output = Result<Frame>> + Send;

    /// Scans for keys matching `pattern` until done or `cancel` fires.
    fn scan_with_cancel(
        &self,
        pattern: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ScanOutcome>> + Send;

    /// Subscribes `listener` to `patterns` until the subscription closes or
    /// `cancel` fires.
    fn psubscribe_with_cancel(
        &self,
        patterns: &[&str],
        listener: Arc<dyn MessageListener>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Subscription>> + Send;

    /// Publishes `message` on `channel`.
    fn publish(
        &self,
        channel: &str,
        message: impl Into<Bytes> + Send,
    ) -> impl Future<Output = Result<PublishOutcome>> + Send;

    /// Returns true if at least one node answers on a pooled connection.
    fn is_connected(&self) -> impl Future<Output = bool> + Send;

    /// Closes every pool and subscription. Idempotent; afterwards every
    /// operation fails with [`Error::Closed`](crate::Error::Closed).
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Same as [`close`](Self::close).
    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        self.close()
    }

    /// Sets a hash field. Returns true if the field is new.
    fn hset(
        &self,
        key: &str,
        field: &str,
        value: impl Into<Bytes> + Send,
    ) -> impl Future<Output = Result<bool>> + Send {
        let cmd = command::hset(key.to_string(), field.to_string(), value);
        async move { Ok(command::frame_to_int(self.execute(cmd).await?)? > 0) }
    }

    /// Reads every field of a hash. A missing key yields an empty map.
    fn hgetall(&self, key: &str) -> impl Future<Output = Result<HashMap<String, Bytes>>> + Send {
        let cmd = command::hgetall(key.to_string());
        async move { command::frame_to_hashmap(self.execute(cmd).await?) }
    }

    /// Removes hash fields. Returns how many existed.
    fn hdel(&self, key: &str, fields: &[&str]) -> impl Future<Output = Result<i64>> + Send {
        let cmd = command::hdel(key.to_string(), fields.iter().map(|f| f.to_string()));
        async move { command::frame_to_int(self.execute(cmd).await?) }
    }

    /// Deletes a key. Returns true if it existed.
    fn del(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        let cmd = command::del([key.to_string()]);
        async move { Ok(command::frame_to_int(self.execute(cmd).await?)? > 0) }
    }

    /// Reads a string value.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>>> + Send {
        let cmd = command::get(key.to_string());
        async move { command::frame_to_bytes(self.execute(cmd).await?) }
    }

    /// Writes a string value.
    fn set(&self, key: &str, value: impl Into<Bytes> + Send) -> impl Future<Output = Result<()>> + Send {
        let cmd = command::set(key.to_string(), value);
        async move {
            self.execute(cmd).await?;
            Ok(())
        }
    }

    /// Scans for keys matching `pattern` across every node.
    fn scan(&self, pattern: &str) -> impl Future<Output = Result<ScanOutcome>> + Send {
        async move {
            let cancel = CancellationToken::new();
            self.scan_with_cancel(pattern, &cancel).await
        }
    }

    /// Subscribes `listener` to `patterns` on every node.
    fn psubscribe<L: MessageListener>(
        &self,
        patterns: &[&str],
        listener: L,
    ) -> impl Future<Output = Result<Subscription>> + Send {
        async move {
            let cancel = CancellationToken::new();
            self.psubscribe_with_cancel(patterns, Arc::new(listener), &cancel)
                .await
        }
    }
}
