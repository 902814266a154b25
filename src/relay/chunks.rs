//! Reassembly of chunked results.
//!
//! Long-running scans on the host deliver their result as several
//! [`ChunkFrame`]s sharing one correlation id. The aggregator keeps one
//! ordered, sparse buffer per id and hands back the combined value once every
//! slot is filled.

use std::collections::HashMap;

use serde_json::Value;

use super::protocol::ChunkFrame;

/// What happened to a chunk handed to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Stored; more chunks are needed.
    Pending {
        /// Slots filled so far.
        received: usize,
        /// Slots expected in total.
        expected: usize,
    },
    /// The last missing chunk arrived; this is the combined result.
    Complete(Value),
    /// The chunk carried the host's error marker. The buffer was discarded.
    Failed(String),
    /// The slot was already filled. The chunk was ignored.
    Duplicate,
    /// The chunk disagrees with the buffer (index out of range or a different
    /// `chunkCount`). The chunk was ignored.
    Inconsistent(String),
    /// The announced `chunkCount` cannot be honoured. Nothing was buffered.
    Invalid(String),
}

/// Per-id aggregation buffer.
#[derive(Debug)]
struct ChunkedResult {
    slots: Vec<Option<Value>>,
    filled: usize,
}

impl ChunkedResult {
    fn new(expected: usize) -> Self {
        Self {
            slots: vec![None; expected],
            filled: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    fn into_value(self) -> Value {
        concat_payloads(self.slots.into_iter().flatten().collect())
    }
}

/// Owns the aggregation buffers of every chunked request in flight.
#[derive(Debug)]
pub struct ChunkAggregator {
    buffers: HashMap<String, ChunkedResult>,
    max_chunk_count: usize,
}

impl ChunkAggregator {
    /// Creates an aggregator that refuses results announced with more than
    /// `max_chunk_count` chunks.
    #[must_use]
    pub fn new(max_chunk_count: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_chunk_count,
        }
    }

    /// Stores one chunk and reports the resulting state of its buffer.
    pub fn accept(&mut self, chunk: ChunkFrame) -> ChunkOutcome {
        let ChunkFrame {
            id,
            index,
            count,
            body,
        } = chunk;

        let payload = match body {
            Ok(payload) => payload,
            Err(message) => {
                self.buffers.remove(&id);
                return ChunkOutcome::Failed(message);
            }
        };

        if !self.buffers.contains_key(&id) {
            if count == 0 {
                return ChunkOutcome::Invalid("chunkCount must be at least 1".to_string());
            }
            if count > self.max_chunk_count {
                return ChunkOutcome::Invalid(format!(
                    "chunkCount {count} exceeds the limit of {}",
                    self.max_chunk_count
                ));
            }
        }

        let buffer = self
            .buffers
            .entry(id.clone())
            .or_insert_with(|| ChunkedResult::new(count));

        if buffer.slots.len() != count {
            return ChunkOutcome::Inconsistent(format!(
                "chunkCount {count} differs from the {} announced earlier",
                buffer.slots.len()
            ));
        }

        let Some(slot) = buffer.slots.get_mut(index) else {
            return ChunkOutcome::Inconsistent(format!(
                "chunkIndex {index} is out of range for {count} chunks"
            ));
        };

        if slot.is_some() {
            return ChunkOutcome::Duplicate;
        }

        *slot = Some(payload);
        buffer.filled += 1;

        if !buffer.is_complete() {
            return ChunkOutcome::Pending {
                received: buffer.filled,
                expected: count,
            };
        }

        match self.buffers.remove(&id) {
            Some(buffer) => ChunkOutcome::Complete(buffer.into_value()),
            None => ChunkOutcome::Inconsistent("buffer vanished".to_string()),
        }
    }

    /// Drops the buffer for `id`, if any.
    pub fn discard(&mut self, id: &str) -> bool {
        self.buffers.remove(id).is_some()
    }

    /// Drops every buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Number of results currently being assembled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns `true` if nothing is being assembled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Joins chunk payloads in order.
///
/// Arrays are flattened into one array and strings are concatenated, so a
/// chunked result equals the single response that would have carried the
/// whole payload. A lone part is returned as is. Any other mix is returned
/// as an array of the parts.
#[must_use]
pub fn concat_payloads(mut parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        return parts.pop().unwrap_or(Value::Null);
    }

    if parts.iter().all(Value::is_array) {
        let items = parts
            .into_iter()
            .flat_map(|part| match part {
                Value::Array(items) => items,
                _ => Vec::new(),
            })
            .collect();
        return Value::Array(items);
    }

    if parts.iter().all(Value::is_string) {
        let text: String = parts.iter().filter_map(Value::as_str).collect();
        return Value::String(text);
    }

    Value::Array(parts)
}
