//! Command relay between the tool layer and the Figma plugin.
//!
//! All commands share one persistent WebSocket link to the relay server.
//! The link is opened lazily by the first call that needs it, and commands
//! are multiplexed over it by correlation id.
//!
//! # Architecture
//!
//! ```text
//!   join_channel()          send_command()
//!        │                        │
//!        ▼                        ▼
//!  ┌───────────┐  requires  ┌────────────┐   pending table
//!  │  Channel  │◀───────────│ Dispatcher │──────────────┐
//!  └─────┬─────┘            └─────┬──────┘              │
//!        │ connect() / send()     │                     ▼
//!        ▼                        ▼               ┌──────────┐
//!  ┌──────────────────────────────────────┐ frames │  Router  │──▶ Chunks
//!  │              Connection              │───────▶│          │
//!  └──────────────────────────────────────┘        └──────────┘
//! ```
//!
//! Everything mutable lives in one [`RelayState`](state::RelayState) behind a
//! single lock that is never held across an `.await`, so each request is
//! resolved exactly once and a connection loss fails every pending request
//! in one step.
//!
//! # Example
//!
//! ```ignore
//! let relay = Relay::websocket(config.relay.clone());
//! relay.join_channel("my-file").await?;
//! let info = relay.send_command("get_document_info", json!({}), None).await?;
//! ```

mod channel;
mod connection;
mod dispatcher;
mod router;

pub mod chunks;
pub mod error;
pub mod protocol;
pub mod state;
pub mod transport;

pub use error::{RelayError, RelayResult};
pub use state::RelayDiagnostics;
pub use transport::{Connector, Link, MemoryConnector, MemoryHost, WebSocketConnector};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::config::RelayConfig;
use state::RelayState;

/// State shared by every clone of a [`Relay`] and its background tasks.
struct Shared {
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<RelayState>,
}

/// Handle to the command relay.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.shared.config.url)
            .field("channel", &self.current_channel())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Creates a relay that opens links through `connector`.
    ///
    /// Nothing is connected until the first call that needs the link.
    #[must_use]
    pub fn new(config: RelayConfig, connector: Arc<dyn Connector>) -> Self {
        let state = RelayState::new(config.max_chunk_count);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state: Mutex::new(state),
            }),
        }
    }

    /// Creates a relay that connects over WebSocket.
    #[must_use]
    pub fn websocket(config: RelayConfig) -> Self {
        Self::new(config, Arc::new(WebSocketConnector))
    }

    /// Opens the link if it is not already open.
    ///
    /// Concurrent callers share a single attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if every attempt failed.
    pub async fn connect(&self) -> RelayResult<()> {
        self.shared.connect().await
    }

    /// Joins `channel`, replacing any current channel.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the link cannot be opened and
    /// [`RelayError::ChannelJoin`] if the relay rejects the join or does not
    /// acknowledge it in time.
    pub async fn join_channel(&self, channel: &str) -> RelayResult<()> {
        self.shared.join_channel(channel).await
    }

    /// Sends `command` to the plugin and waits for its result.
    ///
    /// `timeout` defaults to the configured command timeout. Progress updates
    /// and chunks from the host push the deadline back.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the link cannot be opened,
    /// [`RelayError::NoChannel`] if no channel is joined,
    /// [`RelayError::Timeout`] if the deadline passes,
    /// [`RelayError::Remote`] if the plugin reports a failure, and
    /// [`RelayError::ConnectionLost`] if the link drops first.
    pub async fn send_command(
        &self,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> RelayResult<Value> {
        self.shared.send_command(command, params, timeout).await
    }

    /// Closes the link, failing everything in flight with
    /// [`RelayError::ConnectionLost`].
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// The channel currently joined, if any.
    #[must_use]
    pub fn current_channel(&self) -> Option<String> {
        self.shared.state.lock().channel.clone()
    }

    /// Returns `true` if the link is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_connected()
    }

    /// Snapshot of the anomaly counters.
    #[must_use]
    pub fn diagnostics(&self) -> RelayDiagnostics {
        self.shared.state.lock().diagnostics()
    }
}
