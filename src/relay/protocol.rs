//! Wire format of the relay connection.
//!
//! Every frame is a single JSON object sent as a WebSocket text message.
//!
//! # Outbound
//!
//! - Command: `{"id", "channel", "type": "command", "command", "params"}`
//! - Join: `{"type": "join", "channel"}`
//!
//! # Inbound
//!
//! - Success: `{"id", "result"}`
//! - Failure: `{"id", "error": {"message"}}` (a bare string is also accepted)
//! - Chunk: `{"id", "chunkIndex", "chunkCount", "payload"}`, or with `error`
//!   in place of `payload` when the host failed mid-scan
//! - Progress: `{"type": "progress_update", "id", "progress", "message"}`
//! - Join acknowledgement: `{"type": "join-ack", "channel", "success", "error"}`
//!
//! The relay may wrap any inbound frame in a broadcast envelope of the form
//! `{"type", "channel", "message": {...}}`. The inner object is routed.

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::{RelayError, RelayResult};

/// Frame type of an outbound command.
const COMMAND_TYPE: &str = "command";

/// Frame type of an outbound join.
const JOIN_TYPE: &str = "join";

/// Frame type of an inbound join acknowledgement.
const JOIN_ACK_TYPE: &str = "join-ack";

/// Frame type of an inbound progress update.
const PROGRESS_TYPE: &str = "progress_update";

/// Commands that manage the connection itself and may be sent without a
/// current channel.
pub const CHANNEL_MANAGEMENT_COMMANDS: &[&str] = &["join"];

/// Returns `true` if `command` may be sent before a channel is joined.
#[must_use]
pub fn is_channel_management(command: &str) -> bool {
    CHANNEL_MANAGEMENT_COMMANDS.contains(&command)
}

/// An outbound command.
#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'static str,
    command: &'a str,
    params: &'a Value,
}

/// An outbound join request.
#[derive(Debug, Serialize)]
struct JoinFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: &'a str,
}

/// Serialises a command envelope.
///
/// # Errors
///
/// Returns [`RelayError::Protocol`] if the parameters cannot be serialised.
pub fn encode_command(
    id: &str,
    channel: Option<&str>,
    command: &str,
    params: &Value,
) -> RelayResult<String> {
    let envelope = CommandEnvelope {
        id,
        channel,
        kind: COMMAND_TYPE,
        command,
        params,
    };
    serde_json::to_string(&envelope).map_err(|e| RelayError::Protocol {
        message: format!("failed to encode command '{command}': {e}"),
    })
}

/// Serialises a join request.
///
/// # Errors
///
/// Returns [`RelayError::Protocol`] if serialisation fails.
pub fn encode_join(channel: &str) -> RelayResult<String> {
    let frame = JoinFrame {
        kind: JOIN_TYPE,
        channel,
    };
    serde_json::to_string(&frame).map_err(|e| RelayError::Protocol {
        message: format!("failed to encode join for '{channel}': {e}"),
    })
}

/// One fragment of a chunked result.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    /// Correlation id of the originating command.
    pub id: String,
    /// Position of this fragment.
    pub index: usize,
    /// Total number of fragments announced by the host.
    pub count: usize,
    /// The fragment, or the host's error message.
    pub body: Result<Value, String>,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A direct response to a command.
    Response {
        /// Correlation id.
        id: String,
        /// The result, or the host's error message.
        outcome: Result<Value, String>,
    },
    /// A fragment of a chunked result.
    Chunk(ChunkFrame),
    /// The host is still working on a command.
    Progress {
        /// Correlation id.
        id: String,
        /// Completion percentage, if reported.
        progress: Option<f64>,
        /// Status message, if reported.
        message: Option<String>,
    },
    /// Answer to a join request.
    JoinAck {
        /// Channel the answer refers to.
        channel: String,
        /// Whether the join was accepted.
        success: bool,
        /// Rejection reason, if any.
        error: Option<String>,
    },
    /// A frame that carries nothing for us (our own echoed command or a
    /// relay notice).
    Ignored(&'static str),
}

/// Parses a raw inbound frame.
///
/// # Errors
///
/// Returns a description of the problem if the frame is not valid JSON, is
/// not an object, or lacks the fields needed to route it.
pub fn parse_frame(raw: &str) -> Result<InboundFrame, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(mut outer) = value else {
        return Err("frame is not a JSON object".to_string());
    };

    let outer_type = outer.get("type").and_then(Value::as_str).map(str::to_owned);
    let outer_id = outer.get("id").and_then(id_of);

    let body = match outer.remove("message") {
        Some(Value::Object(inner)) => inner,
        Some(other) => {
            outer.insert("message".to_string(), other);
            outer
        }
        None => outer,
    };

    let kind = body
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or(outer_type);

    match kind.as_deref() {
        Some(JOIN_ACK_TYPE) => return Ok(parse_join_ack(&body)),
        Some(PROGRESS_TYPE) => return parse_progress(&body, outer_id),
        _ => {}
    }

    let Some(id) = body.get("id").and_then(id_of).or(outer_id) else {
        return if kind.is_some() {
            Ok(InboundFrame::Ignored("relay notice"))
        } else {
            Err("frame has no id".to_string())
        };
    };

    if body.contains_key("chunkIndex") || body.contains_key("chunkCount") {
        return parse_chunk(id, &body).map(InboundFrame::Chunk);
    }

    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Ok(InboundFrame::Response {
            id,
            outcome: Err(error_message(error)),
        });
    }

    if let Some(result) = body.get("result") {
        return Ok(InboundFrame::Response {
            id,
            outcome: Ok(result.clone()),
        });
    }

    if body.contains_key("command") {
        return Ok(InboundFrame::Ignored("echoed command"));
    }

    Err(format!("frame for id '{id}' has neither result nor error"))
}

/// Reads a correlation id, accepting strings and integers.
fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extracts a human-readable message from an `error` field.
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_owned),
        other => other.to_string(),
    }
}

fn parse_join_ack(body: &Map<String, Value>) -> InboundFrame {
    let channel = body
        .get("channel")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    // An acknowledgement without an explicit verdict is an acceptance.
    let success = body.get("success").and_then(Value::as_bool).unwrap_or(true);
    let error = body.get("error").filter(|e| !e.is_null()).map(error_message);

    InboundFrame::JoinAck {
        channel,
        success,
        error,
    }
}

fn parse_progress(
    body: &Map<String, Value>,
    outer_id: Option<String>,
) -> Result<InboundFrame, String> {
    let id = body
        .get("id")
        .and_then(id_of)
        .or(outer_id)
        .ok_or_else(|| "progress update has no id".to_string())?;

    let data = body.get("data").and_then(Value::as_object).unwrap_or(body);
    let progress = data.get("progress").and_then(Value::as_f64);
    let message = data
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned);

    Ok(InboundFrame::Progress {
        id,
        progress,
        message,
    })
}

fn parse_chunk(id: String, body: &Map<String, Value>) -> Result<ChunkFrame, String> {
    let index = body
        .get("chunkIndex")
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| format!("chunk for id '{id}' has no valid chunkIndex"))?;
    let count = body
        .get("chunkCount")
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| format!("chunk for id '{id}' has no valid chunkCount"))?;

    let body = match body.get("error").filter(|e| !e.is_null()) {
        Some(error) => Err(error_message(error)),
        None => Ok(body.get("payload").cloned().unwrap_or(Value::Null)),
    };

    Ok(ChunkFrame {
        id,
        index,
        count,
        body,
    })
}
