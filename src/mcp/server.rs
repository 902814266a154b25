//! MCP server lifecycle.
//!
//! 1. **Initialisation**: `initialize` followed by the
//!    `notifications/initialized` notification
//! 2. **Operation**: `tools/list`, `tools/call` and `ping`
//! 3. **Shutdown**: end of input or a termination signal
//!
//! Lifecycle requests are answered in arrival order. Tool calls are
//! forwarded to the Figma plugin through [`FigmaTools`] on their own tasks,
//! so a slow call does not hold up `ping` or other tools; their responses
//! are written as they complete.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::mcp::protocol::{
    parse_message, ErrorCode, IncomingMessage, JsonRpcError, JsonRpcErrorData,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, MCP_PROTOCOL_VERSION,
    SERVER_NAME,
};
use crate::mcp::tools::FigmaTools;
use crate::mcp::transport::{LineTransport, StdioTransport};

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

/// Server capabilities advertised during initialisation.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolCapabilities>,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            tools: Some(ToolCapabilities::default()),
        }
    }
}

/// Tool-specific capabilities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change during the session.
    #[serde(rename = "listChanged", skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // skip_serializing_if takes fn(&T) -> bool
const fn is_false(b: &bool) -> bool {
    !*b
}

/// Server information for the initialisation response.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Client information received during initialisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by client.
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Client information.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// A tool definition for the tools/list response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

/// Parameters for the tools/call request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default)]
    pub arguments: Value,
}

/// Content item in a tool call response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text content.
    Text {
        /// The text content.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Image bytes, base64-encoded.
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Result of a tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content returned by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the tool call resulted in an error.
    #[serde(skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_content(vec![ToolContent::Text { text: text.into() }])
    }

    /// Creates a successful result from several content items.
    #[must_use]
    pub const fn with_content(content: Vec<ToolContent>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Creates a successful image result.
    #[must_use]
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::with_content(vec![ToolContent::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }])
    }

    /// Creates an error text result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }
}

/// The outcome of one request.
type Reply = Result<JsonRpcResponse, JsonRpcError>;

/// The MCP server bridging an MCP client to the Figma plugin.
pub struct McpServer<R, W> {
    /// Current server state.
    state: ServerState,
    /// The transport layer.
    transport: LineTransport<R, W>,
    /// Negotiated protocol version (set after initialisation).
    protocol_version: Option<String>,
    /// Tool handlers, shared with running tool calls.
    tools: Arc<FigmaTools>,
    /// Tool calls still running.
    calls: JoinSet<Reply>,
}

impl McpServer<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Creates a server speaking over stdin and stdout.
    #[must_use]
    pub fn stdio(tools: FigmaTools) -> Self {
        Self::new(StdioTransport::stdio(), tools)
    }
}

impl<R, W> McpServer<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a server over the given transport.
    #[must_use]
    pub fn new(transport: LineTransport<R, W>, tools: FigmaTools) -> Self {
        Self {
            state: ServerState::AwaitingInit,
            transport,
            protocol_version: None,
            tools: Arc::new(tools),
            calls: JoinSet::new(),
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Protocol version agreed during initialisation.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Runs the server until end of input or a termination signal.
    ///
    /// At end of input, running tool calls are finished and answered. A
    /// signal aborts them.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut result = self.run_with_shutdown().await;
        if result.is_ok() {
            result = self.finish_calls().await;
        }
        self.tools.relay().disconnect();
        result
    }

    /// Runs the server until end of input, ignoring signals.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn serve(&mut self) -> std::io::Result<()> {
        let mut result = self.serve_until_eof().await;
        if result.is_ok() {
            result = self.finish_calls().await;
        }
        self.tools.relay().disconnect();
        result
    }

    async fn serve_until_eof(&mut self) -> std::io::Result<()> {
        loop {
            tokio::select! {
                Some(done) = self.calls.join_next(), if !self.calls.is_empty() => {
                    self.write_reply(done).await?;
                }

                line_result = self.transport.read_line() => {
                    if self.handle_transport_result(line_result).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Waits for every running tool call and writes its response.
    async fn finish_calls(&mut self) -> std::io::Result<()> {
        while let Some(done) = self.calls.join_next().await {
            self.write_reply(done).await?;
        }
        Ok(())
    }

    /// Writes the response of a finished tool call.
    async fn write_reply(&mut self, done: Result<Reply, JoinError>) -> std::io::Result<()> {
        match done {
            Ok(Ok(response)) => self.transport.write_message(&response).await,
            Ok(Err(error)) => self.transport.write_message(&error).await,
            Err(e) if e.is_cancelled() => {
                debug!("Tool call aborted");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Tool call task failed");
                Ok(())
            }
        }
    }

    /// Runs the main loop and handles shutdown.
    #[cfg(unix)]
    async fn run_with_shutdown(&mut self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(std::io::Error::other)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(std::io::Error::other)?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    self.state = ServerState::ShuttingDown;
                    self.calls.abort_all();
                    return Ok(());
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    self.state = ServerState::ShuttingDown;
                    self.calls.abort_all();
                    return Ok(());
                }

                Some(done) = self.calls.join_next(), if !self.calls.is_empty() => {
                    self.write_reply(done).await?;
                }

                line_result = self.transport.read_line() => {
                    if self.handle_transport_result(line_result).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs the main loop and handles shutdown.
    #[cfg(windows)]
    async fn run_with_shutdown(&mut self) -> std::io::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                    self.state = ServerState::ShuttingDown;
                    self.calls.abort_all();
                    return Ok(());
                }

                Some(done) = self.calls.join_next(), if !self.calls.is_empty() => {
                    self.write_reply(done).await?;
                }

                line_result = self.transport.read_line() => {
                    if self.handle_transport_result(line_result).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handles the result of one transport read.
    ///
    /// Returns `true` if the server should shut down.
    async fn handle_transport_result(
        &mut self,
        line_result: std::io::Result<Option<String>>,
    ) -> std::io::Result<bool> {
        let Some(line) = line_result? else {
            debug!("Input closed");
            self.state = ServerState::ShuttingDown;
            return Ok(true);
        };

        if line.trim().is_empty() {
            return Ok(false);
        }

        match parse_message(&line) {
            Ok(IncomingMessage::Request(req)) => self.handle_request(req).await?,
            Ok(IncomingMessage::Notification(notif)) => self.handle_notification(&notif),
            Err(error) => self.transport.write_message(&error).await?,
        }

        Ok(self.state == ServerState::ShuttingDown)
    }

    /// Handles an incoming request.
    async fn handle_request(&mut self, req: JsonRpcRequest) -> std::io::Result<()> {
        debug!(id = %req.id, method = %req.method, "Request");

        let response = match req.method.as_str() {
            "initialize" => self.handle_initialize(&req),
            "tools/list" => self.handle_tools_list(&req),
            "tools/call" => match self.spawn_tools_call(&req) {
                Ok(()) => return Ok(()),
                Err(error) => Err(error),
            },
            "ping" => Ok(JsonRpcResponse::success(req.id.clone(), json!({}))),
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        };

        match response {
            Ok(resp) => self.transport.write_message(&resp).await,
            Err(error) => self.transport.write_message(&error).await,
        }
    }

    /// Handles an incoming notification.
    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        if notif.method == "notifications/initialized" && self.state == ServerState::Initialising {
            info!("Client initialised");
            self.state = ServerState::Running;
        } else {
            debug!(method = %notif.method, "Ignoring notification");
        }
    }

    /// Handles the initialize request.
    fn handle_initialize(&mut self, req: &JsonRpcRequest) -> Reply {
        if self.state != ServerState::AwaitingInit {
            return Err(JsonRpcError::new(
                Some(req.id.clone()),
                JsonRpcErrorData::with_message(
                    ErrorCode::InvalidRequest,
                    "Server already initialised",
                ),
            ));
        }

        let params: InitializeParams = parse_params(req, "initialize")?;
        if params.protocol_version != MCP_PROTOCOL_VERSION {
            warn!(
                requested = %params.protocol_version,
                offered = MCP_PROTOCOL_VERSION,
                "Client requested a different protocol version"
            );
        }
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = ?client.version, "Client connected");
        }

        self.protocol_version = Some(MCP_PROTOCOL_VERSION.to_string());
        self.state = ServerState::Initialising;

        let result = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ServerCapabilities::default(),
            "serverInfo": ServerInfo::default(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    /// Handles the tools/list request.
    fn handle_tools_list(&self, req: &JsonRpcRequest) -> Reply {
        self.require_running(&req.id)?;

        let result = json!({
            "tools": FigmaTools::definitions(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    /// Starts a tools/call request on its own task.
    ///
    /// The response is written by the main loop once the call completes.
    fn spawn_tools_call(&mut self, req: &JsonRpcRequest) -> Result<(), JsonRpcError> {
        self.require_running(&req.id)?;

        let params: ToolCallParams = parse_params(req, "tool call")?;
        let tools = Arc::clone(&self.tools);
        let id = req.id.clone();

        self.calls.spawn(async move {
            let result = tools.call(&params.name, &params.arguments).await;
            match serde_json::to_value(&result) {
                Ok(result_value) => Ok(JsonRpcResponse::success(id, result_value)),
                Err(e) => {
                    error!(error = %e, "Failed to serialise tool call result");
                    Err(JsonRpcError::internal_error(
                        id,
                        "Internal error: failed to serialise result",
                    ))
                }
            }
        });
        Ok(())
    }

    /// Ensures the server is in the Running state.
    fn require_running(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.state != ServerState::Running {
            return Err(JsonRpcError::invalid_request(
                Some(id.clone()),
                "Server not initialised",
            ));
        }
        Ok(())
    }
}

/// Deserialises the request's params, which must be present.
fn parse_params<T: serde::de::DeserializeOwned>(
    req: &JsonRpcRequest,
    what: &str,
) -> Result<T, JsonRpcError> {
    let params = req.params.clone().ok_or_else(|| {
        JsonRpcError::invalid_params(req.id.clone(), format!("Missing {what} params"))
    })?;
    serde_json::from_value(params).map_err(|e| {
        JsonRpcError::invalid_params(req.id.clone(), format!("Invalid {what} params: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::{MemoryConnector, Relay};
    use std::sync::Arc;

    fn server() -> McpServer<&'static [u8], Vec<u8>> {
        let (connector, _hosts) = MemoryConnector::new();
        let relay = Relay::new(RelayConfig::default(), Arc::new(connector));
        McpServer::new(
            LineTransport::new(&b""[..], Vec::new()),
            FigmaTools::new(relay, None),
        )
    }

    #[test]
    fn server_initial_state() {
        assert_eq!(server().state(), ServerState::AwaitingInit);
    }

    #[test]
    fn tool_call_result_text() {
        let result = ToolCallResult::text("Hello, world!");
        assert!(!result.is_error);
        assert_eq!(
            result.content,
            vec![ToolContent::Text {
                text: "Hello, world!".to_string()
            }]
        );
    }

    #[test]
    fn tool_call_result_error() {
        let result = ToolCallResult::error("Something went wrong");
        assert!(result.is_error);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isError"], true);
        assert_eq!(value["content"][0]["type"], "text");
    }

    #[test]
    fn image_content_serialises_mime_type() {
        let value = serde_json::to_value(ToolCallResult::image("iVBOR", "image/png")).unwrap();
        assert_eq!(
            value,
            json!({"content": [{"type": "image", "data": "iVBOR", "mimeType": "image/png"}]})
        );
    }

    #[tokio::test]
    async fn tools_list_requires_initialisation() {
        let mut server = server();
        let req: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
                .unwrap();
        let err = server.handle_tools_list(&req).unwrap_err();
        assert_eq!(err.error.code, ErrorCode::InvalidRequest.code());

        let init: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 2, "method": "initialize",
            "params": {"protocolVersion": MCP_PROTOCOL_VERSION, "capabilities": {}}
        }))
        .unwrap();
        server.handle_initialize(&init).unwrap();
        assert_eq!(server.state(), ServerState::Initialising);
        assert_eq!(server.protocol_version(), Some(MCP_PROTOCOL_VERSION));
        assert!(server.handle_initialize(&init).is_err());

        let notif: JsonRpcNotification = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .unwrap();
        server.handle_notification(&notif);
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.handle_tools_list(&req).is_ok());
    }
}
