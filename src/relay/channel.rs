//! Channel membership.
//!
//! The relay routes commands by channel name, so a client has to join one
//! before it can talk to the plugin. At most one channel is current. It is
//! cleared when a join starts, when a join fails and when the link drops;
//! nothing rejoins automatically.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::error::{RelayError, RelayResult};
use super::protocol;
use super::state::RelayState;
use super::Shared;

/// A join request awaiting its acknowledgement.
#[derive(Debug)]
pub struct PendingJoin {
    channel: String,
    resolver: oneshot::Sender<RelayResult<()>>,
}

impl PendingJoin {
    /// Fails the join with `error`.
    pub fn fail(self, error: RelayError) {
        let _ = self.resolver.send(Err(error));
    }
}

impl RelayState {
    /// Returns the current channel.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoChannel`] if no channel has been joined.
    pub fn require_channel(&self) -> RelayResult<String> {
        self.channel.clone().ok_or(RelayError::NoChannel)
    }

    /// Applies a join acknowledgement.
    ///
    /// Returns `false` if no join for `channel` was waiting.
    pub fn complete_join(&mut self, channel: &str, success: bool, error: Option<String>) -> bool {
        let waiting_for_this = self
            .pending_join
            .as_ref()
            .is_some_and(|join| join.channel == channel);
        if !waiting_for_this {
            return false;
        }
        let Some(join) = self.pending_join.take() else {
            return false;
        };

        if success {
            self.channel = Some(join.channel);
            let _ = join.resolver.send(Ok(()));
        } else {
            let reason = error.unwrap_or_else(|| "rejected by relay".to_string());
            join.fail(RelayError::ChannelJoin {
                channel: channel.to_string(),
                reason,
            });
        }
        true
    }
}

impl Shared {
    /// Joins `name`, connecting first if needed.
    pub(super) async fn join_channel(self: &Arc<Self>, name: &str) -> RelayResult<()> {
        if name.trim().is_empty() {
            return Err(RelayError::ChannelJoin {
                channel: name.to_string(),
                reason: "channel name must not be empty".to_string(),
            });
        }

        self.connect().await?;

        let mut acknowledged = {
            let mut state = self.state.lock();
            state.channel = None;

            let (tx, rx) = oneshot::channel();
            let join = PendingJoin {
                channel: name.to_string(),
                resolver: tx,
            };
            if let Some(previous) = state.pending_join.replace(join) {
                let channel = previous.channel.clone();
                previous.fail(RelayError::ChannelJoin {
                    channel,
                    reason: "superseded by a newer join".to_string(),
                });
            }

            let sent = protocol::encode_join(name).and_then(|frame| state.send(frame));
            if let Err(e) = sent {
                state.pending_join = None;
                return Err(e);
            }
            rx
        };

        debug!(channel = name, "Sent join request");

        let outcome = match tokio::time::timeout(self.config.join_timeout(), &mut acknowledged).await {
            Ok(settled) => settled.unwrap_or(Err(RelayError::ConnectionLost)),
            Err(_) => {
                let mut state = self.state.lock();
                // The acknowledgement is applied under this lock, so checking
                // here cannot race with the router.
                match acknowledged.try_recv() {
                    Ok(settled) => settled,
                    Err(_) => {
                        state.pending_join = None;
                        Err(RelayError::ChannelJoin {
                            channel: name.to_string(),
                            reason: format!(
                                "no acknowledgement within {} ms",
                                self.config.join_timeout_ms
                            ),
                        })
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => info!(channel = name, "Joined channel"),
            Err(e) => warn!(channel = name, error = %e, "Failed to join channel"),
        }
        outcome
    }
}
