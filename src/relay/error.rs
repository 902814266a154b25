//! Error types for relay operations.

use thiserror::Error;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced by [`Relay`](super::Relay) operations.
///
/// The type is `Clone` so that a single connection failure can be delivered
/// to every caller waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The transport could not be opened.
    #[error("failed to connect to relay at {url}: {message}")]
    Connection {
        /// Relay URL that was dialled.
        url: String,
        /// Description of the last failure.
        message: String,
    },

    /// The connection dropped while the request was outstanding.
    #[error("connection to relay lost")]
    ConnectionLost,

    /// The join request was rejected or never acknowledged.
    #[error("failed to join channel '{channel}': {reason}")]
    ChannelJoin {
        /// Channel that was requested.
        channel: String,
        /// Why the join failed.
        reason: String,
    },

    /// A command was issued before any channel was joined.
    #[error("not joined to a channel; join a channel before sending commands")]
    NoChannel,

    /// No response arrived before the request deadline.
    #[error("command '{command}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Command that timed out.
        command: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The host reported a failure for the command.
    #[error("{message}")]
    Remote {
        /// Message reported by the host.
        message: String,
    },

    /// A frame could not be encoded or routed.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of what's wrong.
        message: String,
    },

    /// A frame was sent while the connection was not open.
    #[error("cannot send while the relay connection is {state}")]
    IllegalState {
        /// Name of the connection state at the time of sending.
        state: &'static str,
    },

    /// Too many requests are outstanding.
    #[error("too many outstanding requests (limit {limit})")]
    Backpressure {
        /// Configured limit.
        limit: usize,
    },
}

impl RelayError {
    /// Returns `true` if retrying after a reconnect or rejoin may succeed.
    #[must_use]
    pub const fn is_connection_related(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost | Self::NoChannel | Self::IllegalState { .. }
        )
    }
}
