//! Demultiplexing of inbound frames.
//!
//! Every frame read from the link passes through [`RelayState::on_frame`].
//! Frames that cannot be routed (unknown ids, duplicate chunks, garbage) are
//! dropped and counted; none of them ever reaches a caller. A run of
//! `malformed_frame_limit` consecutive unparsable frames is taken as stream
//! corruption and tears the link down.

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::chunks::ChunkOutcome;
use super::error::RelayError;
use super::protocol::{self, ChunkFrame, InboundFrame};
use super::state::RelayState;
use super::Shared;

impl Shared {
    /// Routes one frame read from link `generation`.
    ///
    /// Returns `false` once that link is no longer the live one, telling the
    /// reader to stop.
    pub(super) fn route_frame(&self, generation: u64, raw: &str) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || !state.is_connected() {
            return false;
        }
        state.on_frame(raw, self.config.malformed_frame_limit)
    }
}

impl RelayState {
    /// Parses and routes one inbound frame.
    ///
    /// Returns `false` if the frame ended a malformed run long enough to
    /// force the link down.
    pub fn on_frame(&mut self, raw: &str, malformed_frame_limit: u32) -> bool {
        let frame = match protocol::parse_frame(raw) {
            Ok(frame) => frame,
            Err(reason) => return self.on_malformed(&reason, malformed_frame_limit),
        };
        self.malformed_run = 0;

        match frame {
            InboundFrame::Response { id, outcome } => self.on_response(&id, outcome),
            InboundFrame::Chunk(chunk) => self.on_chunk(chunk),
            InboundFrame::Progress {
                id,
                progress,
                message,
            } => {
                if self.pending.touch(&id) {
                    debug!(id = %id, ?progress, message = message.as_deref().unwrap_or(""), "Progress update");
                } else {
                    self.on_unknown_id(&id, "progress update");
                }
            }
            InboundFrame::JoinAck {
                channel,
                success,
                error,
            } => {
                if !self.complete_join(&channel, success, error) {
                    self.counters.unknown_id_frames += 1;
                    warn!(channel = %channel, "Dropping join acknowledgement nobody asked for");
                }
            }
            InboundFrame::Ignored(what) => trace!(what, "Ignoring frame"),
        }
        true
    }

    fn on_response(&mut self, id: &str, outcome: Result<Value, String>) {
        let outcome = outcome.map_err(|message| RelayError::Remote { message });
        let failed = outcome.is_err();
        if self.pending.resolve(id, outcome) {
            self.chunks.discard(id);
            debug!(id = %id, failed, "Resolved request");
        } else {
            self.on_unknown_id(id, "response");
        }
    }

    fn on_chunk(&mut self, chunk: ChunkFrame) {
        let id = chunk.id.clone();
        if !self.pending.touch(&id) {
            self.on_unknown_id(&id, "chunk");
            return;
        }

        let index = chunk.index;
        match self.chunks.accept(chunk) {
            ChunkOutcome::Pending { received, expected } => {
                trace!(id = %id, index, received, expected, "Buffered chunk");
            }
            ChunkOutcome::Complete(value) => {
                self.pending.resolve(&id, Ok(value));
                debug!(id = %id, "Reassembled chunked result");
            }
            ChunkOutcome::Failed(message) => {
                warn!(id = %id, index, error = %message, "Chunked result failed");
                self.pending.resolve(&id, Err(RelayError::Remote { message }));
            }
            ChunkOutcome::Duplicate => {
                self.counters.duplicate_chunks += 1;
                debug!(id = %id, index, "Ignoring duplicate chunk");
            }
            ChunkOutcome::Inconsistent(reason) => {
                warn!(id = %id, index, reason = %reason, "Ignoring inconsistent chunk");
            }
            ChunkOutcome::Invalid(message) => {
                warn!(id = %id, reason = %message, "Rejecting unusable chunked result");
                self.pending.resolve(&id, Err(RelayError::Protocol { message }));
            }
        }
    }

    fn on_unknown_id(&mut self, id: &str, what: &str) {
        self.counters.unknown_id_frames += 1;
        debug!(id = %id, what, "Dropping frame for unknown id");
    }

    fn on_malformed(&mut self, reason: &str, limit: u32) -> bool {
        self.malformed_run += 1;
        self.counters.malformed_frames += 1;
        warn!(reason, run = self.malformed_run, "Dropping malformed frame");

        if self.malformed_run < limit.max(1) {
            return true;
        }

        self.counters.forced_reconnects += 1;
        let rejected = self.tear_down(&RelayError::ConnectionLost);
        warn!(
            run = limit,
            rejected, "Too many consecutive malformed frames, dropping the connection"
        );
        false
    }
}
