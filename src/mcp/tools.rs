//! Figma tools exposed over MCP.
//!
//! Each tool checks its arguments and forwards one command to the plugin
//! through the [`Relay`]. `get_nodes_info` is the exception: it issues one
//! `get_node_info` per node, all in flight at once.
//!
//! Relay failures never become JSON-RPC errors. They are returned as tool
//! results with `isError` set and a message naming the failed operation,
//! which is what MCP clients show to the model.

use futures_util::future::try_join_all;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mcp::nodes::filter_figma_node;
use crate::mcp::server::{ToolCallResult, ToolContent, ToolDefinition};
use crate::relay::{Relay, RelayError, RelayResult};

/// Formats accepted by `export_node_as_image`.
const EXPORT_FORMATS: &[&str] = &["PNG", "JPG", "SVG", "PDF"];

/// Nodes per chunk requested from `scan_text_nodes`.
const SCAN_CHUNK_SIZE: u64 = 10;

/// Tool handlers backed by a relay connection.
#[derive(Debug)]
pub struct FigmaTools {
    relay: Relay,
    default_channel: Option<String>,
    /// Set once any channel has been joined in this session. Held across
    /// joins so concurrent tool calls join the default channel only once.
    joined_once: Mutex<bool>,
}

impl FigmaTools {
    /// Creates the tool set.
    ///
    /// When `default_channel` is set it is joined before the first command
    /// of the session unless a channel was joined already. It is not
    /// rejoined after a connection loss.
    #[must_use]
    pub fn new(relay: Relay, default_channel: Option<String>) -> Self {
        Self {
            relay,
            default_channel,
            joined_once: Mutex::new(false),
        }
    }

    /// The underlying relay.
    #[must_use]
    pub const fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Dispatches a tools/call by name.
    pub async fn call(&self, name: &str, arguments: &Value) -> ToolCallResult {
        debug!(tool = name, "Tool call");
        match name {
            "join_channel" => self.call_join_channel(arguments).await,
            "get_document_info" => {
                self.forward("get_document_info", json!({}), "getting document info")
                    .await
            }
            "get_selection" => {
                self.forward("get_selection", json!({}), "getting selection")
                    .await
            }
            "get_node_info" => self.call_get_node_info(arguments).await,
            "get_nodes_info" => self.call_get_nodes_info(arguments).await,
            "get_styles" => self.forward("get_styles", json!({}), "getting styles").await,
            "get_local_components" => {
                self.forward(
                    "get_local_components",
                    json!({}),
                    "getting local components",
                )
                .await
            }
            "get_remote_components" => self.call_get_remote_components().await,
            "get_annotations" => self.call_get_annotations(arguments).await,
            "scan_text_nodes" => self.call_scan_text_nodes(arguments).await,
            "export_node_as_image" => self.call_export_node_as_image(arguments).await,
            _ => ToolCallResult::error(format!("Unknown tool: {name}")),
        }
    }

    /// Joins the default channel if this session has not joined one yet.
    async fn ensure_channel(&self) -> RelayResult<()> {
        let mut joined_once = self.joined_once.lock().await;
        if *joined_once {
            return Ok(());
        }
        let Some(channel) = self.default_channel.as_deref() else {
            return Ok(());
        };
        if self.relay.current_channel().is_none() {
            info!(channel, "Joining default channel");
            self.relay.join_channel(channel).await?;
        }
        *joined_once = true;
        Ok(())
    }

    async fn command(&self, command: &str, params: Value) -> RelayResult<Value> {
        self.ensure_channel().await?;
        self.relay.send_command(command, params, None).await
    }

    /// Sends `command` and returns its result as compact JSON text.
    async fn forward(&self, command: &str, params: Value, action: &str) -> ToolCallResult {
        match self.command(command, params).await {
            Ok(result) => ToolCallResult::text(result.to_string()),
            Err(e) => failure(action, &e),
        }
    }

    async fn call_join_channel(&self, arguments: &Value) -> ToolCallResult {
        let channel = arguments
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if channel.is_empty() {
            return ToolCallResult::text("Please provide a channel name to join:");
        }

        let mut joined_once = self.joined_once.lock().await;
        match self.relay.join_channel(channel).await {
            Ok(()) => {
                *joined_once = true;
                ToolCallResult::text(format!("Successfully joined channel: {channel}"))
            }
            Err(e) => failure("joining channel", &e),
        }
    }

    async fn call_get_node_info(&self, arguments: &Value) -> ToolCallResult {
        let Some(node_id) = arguments.get("nodeId").and_then(Value::as_str) else {
            return ToolCallResult::error("Missing required parameter: nodeId");
        };
        match self
            .command("get_node_info", json!({ "nodeId": node_id }))
            .await
        {
            Ok(info) => ToolCallResult::text(filtered(&info).to_string()),
            Err(e) => failure("getting node info", &e),
        }
    }

    async fn call_get_nodes_info(&self, arguments: &Value) -> ToolCallResult {
        let Some(node_ids) = string_array(arguments, "nodeIds") else {
            return ToolCallResult::error(
                "Missing required parameter: nodeIds (array of node ID strings)",
            );
        };

        if let Err(e) = self.ensure_channel().await {
            return failure("getting nodes info", &e);
        }

        let requests = node_ids.iter().map(|node_id| {
            self.relay
                .send_command("get_node_info", json!({ "nodeId": node_id }), None)
        });

        match try_join_all(requests).await {
            Ok(infos) => {
                let infos = infos.iter().map(filtered).collect();
                ToolCallResult::text(Value::Array(infos).to_string())
            }
            Err(e) => failure("getting nodes info", &e),
        }
    }

    async fn call_get_remote_components(&self) -> ToolCallResult {
        match self.command("get_remote_components", json!({})).await {
            Ok(result) => ToolCallResult::text(pretty(&result)),
            Err(e) => failure("getting remote components", &e),
        }
    }

    async fn call_get_annotations(&self, arguments: &Value) -> ToolCallResult {
        let mut params = Map::new();
        if let Some(node_id) = arguments.get("nodeId").and_then(Value::as_str) {
            params.insert("nodeId".to_string(), json!(node_id));
        }
        let include_categories = arguments
            .get("includeCategories")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        params.insert("includeCategories".to_string(), json!(include_categories));

        self.forward("get_annotations", Value::Object(params), "getting annotations")
            .await
    }

    async fn call_scan_text_nodes(&self, arguments: &Value) -> ToolCallResult {
        let Some(node_id) = arguments.get("nodeId").and_then(Value::as_str) else {
            return ToolCallResult::error("Missing required parameter: nodeId");
        };

        let params = json!({
            "nodeId": node_id,
            "useChunking": true,
            "chunkSize": SCAN_CHUNK_SIZE,
        });
        let result = match self.command("scan_text_nodes", params).await {
            Ok(result) => result,
            Err(e) => return failure("scanning text nodes", &e),
        };

        let mut content = vec![text(
            "Starting text node scanning. This may take a moment for large designs...",
        )];

        if let Some(chunks) = result.get("chunks") {
            let total = result.get("totalNodes").cloned().unwrap_or(Value::Null);
            content.push(text(format!(
                "Scan completed:\n- Found {total} text nodes\n- Processed in {chunks} chunks"
            )));
            let nodes = result.get("textNodes").cloned().unwrap_or(Value::Null);
            content.push(text(pretty(&nodes)));
        } else {
            content.push(text(pretty(&result)));
        }

        ToolCallResult::with_content(content)
    }

    async fn call_export_node_as_image(&self, arguments: &Value) -> ToolCallResult {
        let Some(node_id) = arguments.get("nodeId").and_then(Value::as_str) else {
            return ToolCallResult::error("Missing required parameter: nodeId");
        };

        let format = match arguments.get("format") {
            None | Some(Value::Null) => "PNG",
            Some(value) => match value.as_str() {
                Some(f) if EXPORT_FORMATS.contains(&f) => f,
                _ => {
                    return ToolCallResult::error(format!(
                        "Invalid format: expected one of {}",
                        EXPORT_FORMATS.join(", ")
                    ))
                }
            },
        };

        let scale = match arguments.get("scale") {
            None | Some(Value::Null) => 1.0,
            Some(value) => match value.as_f64() {
                Some(s) if s > 0.0 && s.is_finite() => s,
                _ => return ToolCallResult::error("Invalid scale: must be a positive number"),
            },
        };

        let params = json!({ "nodeId": node_id, "format": format, "scale": scale });
        let result = match self.command("export_node_as_image", params).await {
            Ok(result) => result,
            Err(e) => return failure("exporting node as image", &e),
        };

        let Some(data) = result.get("imageData").and_then(Value::as_str) else {
            warn!(node_id, "Export result carried no image data");
            return ToolCallResult::error(
                "Error exporting node as image: plugin returned no image data",
            );
        };
        let mime_type = result
            .get("mimeType")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("image/png");

        ToolCallResult::image(data, mime_type)
    }

    /// Returns the list of available tools.
    #[allow(clippy::too_many_lines)]
    #[must_use]
    pub fn definitions() -> Vec<ToolDefinition> {
        let no_args = || json!({ "type": "object", "properties": {} });
        let node_id_only = |description: &str| {
            json!({
                "type": "object",
                "properties": {
                    "nodeId": { "type": "string", "description": description }
                },
                "required": ["nodeId"]
            })
        };

        vec![
            ToolDefinition {
                name: "join_channel".to_string(),
                description: Some(
                    "Join a specific channel to communicate with Figma. Commands are \
                     only delivered to the plugin listening on the joined channel."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "channel": {
                            "type": "string",
                            "description": "The name of the channel to join",
                            "default": ""
                        }
                    }
                }),
            },
            ToolDefinition {
                name: "get_document_info".to_string(),
                description: Some(
                    "Get detailed information about the current Figma document".to_string(),
                ),
                input_schema: no_args(),
            },
            ToolDefinition {
                name: "get_selection".to_string(),
                description: Some(
                    "Get information about the current selection in Figma".to_string(),
                ),
                input_schema: no_args(),
            },
            ToolDefinition {
                name: "get_node_info".to_string(),
                description: Some(
                    "Get detailed information about a specific node in Figma".to_string(),
                ),
                input_schema: node_id_only("The ID of the node to get information about"),
            },
            ToolDefinition {
                name: "get_nodes_info".to_string(),
                description: Some(
                    "Get detailed information about multiple nodes in Figma. \
                     Results are returned in the order of nodeIds."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "nodeIds": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Array of node IDs to get information about"
                        }
                    },
                    "required": ["nodeIds"]
                }),
            },
            ToolDefinition {
                name: "get_styles".to_string(),
                description: Some("Get all styles from the current Figma document".to_string()),
                input_schema: no_args(),
            },
            ToolDefinition {
                name: "get_local_components".to_string(),
                description: Some(
                    "Get all local components from the Figma document".to_string(),
                ),
                input_schema: no_args(),
            },
            ToolDefinition {
                name: "get_remote_components".to_string(),
                description: Some(
                    "Get available components from team libraries in Figma".to_string(),
                ),
                input_schema: no_args(),
            },
            ToolDefinition {
                name: "get_annotations".to_string(),
                description: Some(
                    "Get all annotations in the current document or a specific node"
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "nodeId": {
                            "type": "string",
                            "description": "Optional node ID to get annotations for a specific node"
                        },
                        "includeCategories": {
                            "type": "boolean",
                            "default": true,
                            "description": "Whether to include category information"
                        }
                    }
                }),
            },
            ToolDefinition {
                name: "scan_text_nodes".to_string(),
                description: Some(
                    "Scan all text nodes in the selected Figma node. Large designs are \
                     processed in chunks by the plugin."
                        .to_string(),
                ),
                input_schema: node_id_only("ID of the node to scan"),
            },
            ToolDefinition {
                name: "export_node_as_image".to_string(),
                description: Some("Export a node as an image from Figma".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "nodeId": {
                            "type": "string",
                            "description": "The ID of the node to export"
                        },
                        "format": {
                            "type": "string",
                            "enum": EXPORT_FORMATS,
                            "description": "Export format (default PNG)"
                        },
                        "scale": {
                            "type": "number",
                            "exclusiveMinimum": 0,
                            "description": "Export scale (default 1)"
                        }
                    },
                    "required": ["nodeId"]
                }),
            },
        ]
    }
}

/// Builds the error result for a failed relay call.
fn failure(action: &str, error: &RelayError) -> ToolCallResult {
    if error.is_connection_related() {
        warn!(error = %error, "Relay unavailable while {action}");
    } else {
        debug!(error = %error, "Error {action}");
    }
    ToolCallResult::error(format!("Error {action}: {error}"))
}

/// A node trimmed for the client; vector nodes become `null`.
fn filtered(node: &Value) -> Value {
    filter_figma_node(node).unwrap_or(Value::Null)
}

fn text(text: impl Into<String>) -> ToolContent {
    ToolContent::Text { text: text.into() }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Reads `key` as an array of strings.
fn string_array<'a>(arguments: &'a Value, key: &str) -> Option<Vec<&'a str>> {
    arguments
        .get(key)?
        .as_array()?
        .iter()
        .map(Value::as_str)
        .collect()
}
