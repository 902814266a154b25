//! Command dispatch and the pending-request table.
//!
//! Every command gets a fresh UUID as its correlation id, a deadline, and a
//! one-shot slot that is filled exactly once: by the router (response, chunk
//! completion or host error), by a connection loss, or by the dispatcher
//! itself on timeout. Dropping the caller's future abandons the request
//! locally; the host is never told to stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{RelayError, RelayResult};
use super::protocol;
use super::Shared;

/// A request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    command: String,
    timeout: Duration,
    deadline: Instant,
    resolver: oneshot::Sender<RelayResult<Value>>,
}

impl PendingRequest {
    /// Creates a request whose deadline is `timeout` from now.
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        timeout: Duration,
        resolver: oneshot::Sender<RelayResult<Value>>,
    ) -> Self {
        Self {
            command: command.into(),
            timeout,
            deadline: deadline_after(timeout),
            resolver,
        }
    }
}

/// Roughly 30 years, used when a timeout is too large to add to now.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The instant `timeout` from now, saturating at [`FAR_FUTURE`].
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Outstanding requests, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    /// Registers a request under `id`.
    pub fn register(&mut self, id: String, request: PendingRequest) {
        self.entries.insert(id, request);
    }

    /// Returns `true` if `id` is outstanding.
    #[cfg(test)]
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Current deadline of `id`.
    #[must_use]
    pub fn deadline(&self, id: &str) -> Option<Instant> {
        self.entries.get(id).map(|r| r.deadline)
    }

    /// Pushes the deadline of `id` back by its original timeout.
    ///
    /// Returns `false` if `id` is not outstanding.
    pub fn touch(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(request) => {
                request.deadline = deadline_after(request.timeout);
                true
            }
            None => false,
        }
    }

    /// Removes `id` and delivers `outcome` to its caller.
    ///
    /// Returns `false` if `id` is not outstanding.
    pub fn resolve(&mut self, id: &str, outcome: RelayResult<Value>) -> bool {
        match self.entries.remove(id) {
            Some(request) => {
                // The caller may have stopped listening; the entry is gone
                // either way.
                let _ = request.resolver.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Removes `id` without notifying anyone.
    pub fn abandon(&mut self, id: &str) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    /// Rejects every outstanding request with `error`.
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&mut self, error: &RelayError) -> usize {
        let count = self.entries.len();
        for (_, request) in self.entries.drain() {
            let _ = request.resolver.send(Err(error.clone()));
        }
        count
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is outstanding.
    #[cfg(test)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Unregisters a request when the caller's future goes away.
struct AbandonOnDrop<'a> {
    shared: &'a Shared,
    id: &'a str,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(request) = state.pending.abandon(self.id) {
            state.chunks.discard(self.id);
            debug!(id = %self.id, command = %request.command, "Abandoned pending request");
        }
    }
}

impl Shared {
    /// Sends `command` and waits for its result.
    pub(super) async fn send_command(
        self: &Arc<Self>,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> RelayResult<Value> {
        self.connect().await?;

        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let id = Uuid::new_v4().to_string();

        let response = {
            let mut state = self.state.lock();

            let channel = if protocol::is_channel_management(command) {
                state.channel.clone()
            } else {
                Some(state.require_channel()?)
            };

            if let Some(limit) = self.config.max_pending_requests {
                if state.pending.len() >= limit {
                    return Err(RelayError::Backpressure { limit });
                }
            }

            let frame = protocol::encode_command(&id, channel.as_deref(), command, &params)?;

            let (tx, rx) = oneshot::channel();
            state
                .pending
                .register(id.clone(), PendingRequest::new(command, timeout, tx));

            if let Err(e) = state.send(frame) {
                state.pending.abandon(&id);
                return Err(e);
            }
            rx
        };

        debug!(id = %id, command, "Sent command");

        let _guard = AbandonOnDrop {
            shared: self,
            id: &id,
        };
        self.await_response(&id, command, timeout, response).await
    }

    /// Waits for the response to `id`, honouring deadline extensions.
    async fn await_response(
        &self,
        id: &str,
        command: &str,
        timeout: Duration,
        mut response: oneshot::Receiver<RelayResult<Value>>,
    ) -> RelayResult<Value> {
        loop {
            let deadline = self.state.lock().pending.deadline(id);
            let Some(deadline) = deadline else {
                // Already settled; the outcome is waiting in the slot.
                return settle(response.await);
            };

            if let Ok(outcome) = tokio::time::timeout_at(deadline, &mut response).await {
                return settle(outcome);
            }

            let expired = {
                let mut state = self.state.lock();
                match state.pending.deadline(id) {
                    Some(extended) if extended > Instant::now() => false,
                    Some(_) => {
                        state.pending.abandon(id);
                        state.chunks.discard(id);
                        state.counters.timeouts += 1;
                        true
                    }
                    None => false,
                }
            };

            if expired {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(id = %id, command, timeout_ms, "Command timed out");
                return Err(RelayError::Timeout {
                    command: command.to_string(),
                    timeout_ms,
                });
            }
        }
    }
}

/// A closed slot means the resolver was dropped without an answer, which
/// only happens when the state is torn down.
fn settle(
    received: Result<RelayResult<Value>, oneshot::error::RecvError>,
) -> RelayResult<Value> {
    received.unwrap_or(Err(RelayError::ConnectionLost))
}
