//! Connection lifecycle.
//!
//! ```text
//!                 connect()                 link opened
//!  Disconnected ────────────▶ Connecting ────────────────▶ Connected
//!        ▲                        │                            │
//!        │    attempts exhausted  │      close / error /       │
//!        └────────────────────────┘      malformed-frame run   │
//!        └─────────────────────────────────────────────────────┘
//! ```
//!
//! Reconnection is lazy: nothing reconnects until the next dispatch calls
//! [`Shared::connect`]. Tearing a link down rejects every pending request with
//! [`RelayError::ConnectionLost`], drops all chunk buffers and clears the
//! current channel, all under the state lock.

use std::mem;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::{RelayError, RelayResult};
use super::state::{LinkState, RelayState};
use super::transport::Link;
use super::Shared;

impl RelayState {
    /// Hands a frame to the transport writer.
    ///
    /// A writer that has gone away means the link is dead even if its read
    /// half is still open, so the link is torn down on the spot.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::IllegalState`] unless connected, or
    /// [`RelayError::ConnectionLost`] if the writer has gone away.
    pub fn send(&mut self, frame: String) -> RelayResult<()> {
        let LinkState::Connected { outbound } = &self.link else {
            return Err(RelayError::IllegalState {
                state: self.link.name(),
            });
        };
        if outbound.send(frame).is_ok() {
            return Ok(());
        }

        let rejected = self.tear_down(&RelayError::ConnectionLost);
        warn!(generation = self.generation, rejected, "Relay writer closed, dropping the connection");
        Err(RelayError::ConnectionLost)
    }

    /// Drops the link and fails everything that depended on it.
    ///
    /// Returns the number of pending requests that were rejected.
    pub fn tear_down(&mut self, reason: &RelayError) -> usize {
        self.link = LinkState::Disconnected;
        self.channel = None;
        self.malformed_run = 0;
        self.chunks.clear();

        if let Some(join) = self.pending_join.take() {
            join.fail(reason.clone());
        }

        self.pending.reject_all(reason)
    }
}

impl Shared {
    /// Ensures the link is open.
    ///
    /// Idempotent: returns at once when connected, joins the in-flight attempt
    /// when one exists, and otherwise starts a new one.
    pub(super) async fn connect(self: &Arc<Self>) -> RelayResult<()> {
        let settled = {
            let mut state = self.state.lock();
            if state.is_connected() {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            if let LinkState::Connecting { waiters } = &mut state.link {
                waiters.push(tx);
            } else {
                state.link = LinkState::Connecting { waiters: vec![tx] };
                // The attempt runs on its own task so that a caller giving up
                // does not leave the state stuck in Connecting.
                tokio::spawn(Arc::clone(self).establish());
            }
            rx
        };

        settled.await.unwrap_or_else(|_| {
            Err(RelayError::Connection {
                url: self.config.url.clone(),
                message: "connection attempt was abandoned".to_string(),
            })
        })
    }

    /// Runs one bounded series of connection attempts.
    async fn establish(self: Arc<Self>) {
        let url = self.config.url.clone();
        let attempts = self.config.connect_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!(url = %url, attempt, attempts, "Connecting to relay");

            match self.connector.open(&url).await {
                Ok(link) => {
                    self.install(link);
                    return;
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "Relay connection attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_backoff()).await;
                    }
                }
            }
        }

        let error = RelayError::Connection {
            url,
            message: last_error,
        };

        let waiters = {
            let mut state = self.state.lock();
            match mem::replace(&mut state.link, LinkState::Disconnected) {
                LinkState::Connecting { waiters } => waiters,
                other => {
                    state.link = other;
                    Vec::new()
                }
            }
        };

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Switches to Connected and starts reading from the new link.
    fn install(self: &Arc<Self>, link: Link) {
        let Link { outbound, inbound } = link;

        let (generation, waiters) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.malformed_run = 0;
            state.counters.connections += 1;
            let waiters = match mem::replace(&mut state.link, LinkState::Connected { outbound }) {
                LinkState::Connecting { waiters } => waiters,
                _ => Vec::new(),
            };
            (state.generation, waiters)
        };

        info!(url = %self.config.url, generation, "Connected to relay");
        tokio::spawn(Arc::clone(self).pump(generation, inbound));

        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Feeds inbound frames to the router until the link ends.
    async fn pump(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(raw) = inbound.recv().await {
            if !self.route_frame(generation, &raw) {
                debug!(generation, "Stopped reading from a retired link");
                return;
            }
        }

        self.link_closed(generation);
    }

    /// Handles the transport closing underneath us.
    fn link_closed(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation || !state.is_connected() {
            return;
        }

        let rejected = state.tear_down(&RelayError::ConnectionLost);
        warn!(generation, rejected, "Relay connection closed");
    }

    /// Closes the link, if open, failing everything in flight.
    pub(super) fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.is_connected() {
            let rejected = state.tear_down(&RelayError::ConnectionLost);
            info!(rejected, "Disconnected from relay");
        }
    }
}
