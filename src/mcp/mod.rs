pub mod connector;
pub mod registry;
pub mod types;

pub use connector::McpConnector;
pub use registry::McpRegistry;
pub use types::{
    resolve_placeholders, McpServerConfig, McpToolInfo, McpToolParameter, McpTransport,
};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to connect to MCP server {server}: {message}")]
    Connect { server: String, message: String },
    #[error("MCP server {server} returned an error: {detail}")]
    Rpc { server: String, detail: Value },
    #[error("MCP transport failure on server {server}: {message}")]
    Transport { server: String, message: String },
    #[error("unknown MCP server: {0}")]
    UnknownServer(String),
    #[error("not connected to MCP server {0}")]
    NotConnected(String),
    #[error("invalid MCP server config: {0}")]
    Config(String),
}
