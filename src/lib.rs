//! figma-relay-mcp: MCP server that reads Figma documents through a plugin relay
//!
//! The Figma plugin and this server both connect to a WebSocket relay and
//! meet on a named channel. Tool calls from the MCP client become commands
//! to the plugin; the plugin's replies, possibly split into chunks, become
//! tool results.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Configuration error types
//! - [`mcp`]: MCP protocol, server lifecycle and tools
//! - [`relay`]: Connection, channel membership and command correlation

pub mod config;
pub mod error;
pub mod mcp;
pub mod relay;
