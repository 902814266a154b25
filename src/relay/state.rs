//! The single state object behind a [`Relay`](super::Relay).
//!
//! Connection state, the current channel, the pending-request table and the
//! chunk buffers all live here, behind one lock. Every mutation goes through
//! methods on [`RelayState`]; the component modules (`connection`, `channel`,
//! `dispatcher`, `router`) each add the methods for their part.

use tokio::sync::{mpsc, oneshot};

use super::channel::PendingJoin;
use super::chunks::ChunkAggregator;
use super::dispatcher::PendingTable;
use super::error::RelayResult;

/// Lifecycle of the transport link.
#[derive(Debug)]
pub enum LinkState {
    /// No link. The next dispatch connects.
    Disconnected,
    /// An attempt is in flight; callers wait on it instead of starting another.
    Connecting {
        /// Callers to release when the attempt settles.
        waiters: Vec<oneshot::Sender<RelayResult<()>>>,
    },
    /// Frames can be sent.
    Connected {
        /// Feeds the transport writer. Dropping it closes the link.
        outbound: mpsc::UnboundedSender<String>,
    },
}

impl LinkState {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
        }
    }
}

/// Counters for anomalies that are recovered locally and never reach a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayDiagnostics {
    /// Requests currently awaiting a response.
    pub pending_requests: usize,
    /// Chunked results currently being assembled.
    pub buffered_results: usize,
    /// Frames dropped because their id was not registered.
    pub unknown_id_frames: u64,
    /// Chunks dropped because their slot was already filled.
    pub duplicate_chunks: u64,
    /// Frames dropped because they could not be parsed.
    pub malformed_frames: u64,
    /// Connections torn down after a run of malformed frames.
    pub forced_reconnects: u64,
    /// Requests that reached their deadline.
    pub timeouts: u64,
    /// Links successfully established.
    pub connections: u64,
}

/// Everything a relay mutates.
#[derive(Debug)]
pub struct RelayState {
    pub(super) link: LinkState,
    /// Incremented on every new link so a stale reader cannot touch a newer one.
    pub(super) generation: u64,
    pub(super) channel: Option<String>,
    pub(super) pending_join: Option<PendingJoin>,
    pub(super) pending: PendingTable,
    pub(super) chunks: ChunkAggregator,
    /// Consecutive malformed frames on the current link.
    pub(super) malformed_run: u32,
    pub(super) counters: RelayDiagnostics,
}

impl RelayState {
    /// Creates a disconnected state.
    #[must_use]
    pub fn new(max_chunk_count: usize) -> Self {
        Self {
            link: LinkState::Disconnected,
            generation: 0,
            channel: None,
            pending_join: None,
            pending: PendingTable::default(),
            chunks: ChunkAggregator::new(max_chunk_count),
            malformed_run: 0,
            counters: RelayDiagnostics::default(),
        }
    }

    /// Returns `true` if frames can be sent.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.link, LinkState::Connected { .. })
    }

    /// Snapshot of the diagnostic counters.
    #[must_use]
    pub fn diagnostics(&self) -> RelayDiagnostics {
        RelayDiagnostics {
            pending_requests: self.pending.len(),
            buffered_results: self.chunks.len(),
            ..self.counters
        }
    }
}
