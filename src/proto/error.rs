use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for shardis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The peer sent something that is not valid RESP, or not the reply shape
    /// the command expects.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error reply.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication with the supplied credential failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// Malformed configuration, such as an unparsable `host:port` token.
    ///
    /// Raised at construction and never retried.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description naming the offending input.
        message: String,
    },

    /// Pool exhaustion or an I/O deadline expired.
    #[error("timed out after {after:?} while {operation}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// The configured deadline.
        after: Duration,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The slot for the requested key is served by another node.
    #[error("MOVED to slot {slot} at {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// The slot is migrating; retry once on the named node after `ASKING`.
    #[error("ASK to slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this slot.
        address: String,
    },

    /// The cluster reported it cannot serve the slot.
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// The slot is being resharded and the command should be retried.
    #[error("TRYAGAIN slot is being migrated")]
    TryAgain,

    /// Every known node was unreachable while refreshing the topology.
    #[error("cluster topology unavailable: none of {attempted} node(s) answered")]
    TopologyUnavailable {
        /// Number of nodes that were tried.
        attempted: usize,
    },

    /// A multi-key command referenced keys in different hash slots.
    #[error("CROSSSLOT keys map to different slots: {slots:?}")]
    CrossSlot {
        /// The distinct slots the keys hashed to.
        slots: Vec<u16>,
    },

    /// The command still failed after every allowed attempt.
    #[error("command failed after {attempts} attempt(s): {source}")]
    CommandFailed {
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The client was closed.
    #[error("client is closed")]
    Closed,
}

impl Error {
    /// Returns true for failures of the connection itself rather than of the
    /// command, which the dispatcher retries.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Timeout { .. } | Error::ConnectionClosed
        )
    }

    /// Returns true for redirection signals consumed by the dispatcher.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::Moved { .. } | Error::Ask { .. })
    }
}
