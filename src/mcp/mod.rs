//! Model Context Protocol (MCP) server.
//!
//! Exposes the Figma plugin's read operations as MCP tools. Messages are
//! JSON-RPC 2.0, one per line, over stdio.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐    ┌──────────┐    ┌─────────────┐    ┌─────────┐
//! │ Transport │───▶│  Server  │───▶│ FigmaTools  │───▶│  Relay  │──▶ plugin
//! │  (stdio)  │    │(lifecycle)│   │ (handlers)  │    │  (ws)   │
//! └───────────┘    └──────────┘    └─────────────┘    └─────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod nodes;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use server::McpServer;
pub use tools::FigmaTools;
pub use transport::{LineTransport, StdioTransport};
