#![forbid(unsafe_code)]
//! Host-side client for the Model Context Protocol (MCP).
//!
//! Spawns a fleet of long-lived child MCP servers, speaks line-framed JSON-RPC
//! 2.0 over their stdio, multiplexes concurrent requests per connection, and
//! presents one asynchronous facade over the fleet: list tools, execute tools,
//! read resources, subscribe to notifications, and aggregate health.
//!
//! ## Layers
//! - [`protocol`] / [`model`]: JSON-RPC envelopes and the MCP catalog types
//!   (tools, resources, content items, server identity).
//! - [`codec`]: newline-delimited JSON framing that tolerates log noise
//!   contaminating a child's stdout.
//! - Transport and multiplexer (internal): one writer task, one reader task,
//!   and a stderr drain per child, plus a pending-request table with per-call
//!   timeouts and a janitor sweep.
//! - [`McpConnection`]: the per-server state machine
//!   (`NEW → STARTING → HANDSHAKING → READY → CLOSING → CLOSED`) with a
//!   handshake policy per [`Dialect`].
//! - [`ServerRegistry`]: owns the fleet, initializes it concurrently, fans out
//!   aggregate operations, and isolates per-server failures.
//! - [`ToolCatalog`]: TTL-bounded snapshot of every server's tool list.
//!
//! ## Wire contract
//! JSON-RPC 2.0, one UTF-8 JSON object per `\n`-terminated line, no
//! Content-Length framing. The client advertises protocol version
//! `2024-11-05` and sends `notifications/initialized` after a successful
//! `initialize`. Children should log to stderr; stray text on stdout is
//! discarded without dropping the connection.
//!
//! ```rust,no_run
//! use mcp_host::{HostConfig, ServerRegistry, ToolCatalog};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HostConfig::from_toml_str(
//!     r#"
//!     [servers.demo]
//!     command = "demo-mcp-server"
//!     timeout_ms = 5000
//!     "#,
//! )?;
//! let registry = ServerRegistry::new(config);
//! registry.initialize_all().await;
//!
//! let result = registry.execute_tool("demo", "ping", None).await?;
//! println!("{result:?}");
//!
//! let catalog = ToolCatalog::new();
//! let tools = catalog.get(&registry).await;
//! println!("{} servers in catalog", tools.len());
//!
//! registry.shutdown().await;
//! # Ok(()) }
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod protocol;
pub mod strategy;

mod mux;
mod registry;
mod transport;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests_core {
    mod catalog_cache;
    mod connection_flows;
    mod registry_flows;
}

pub use crate::catalog::{ToolCatalog, DEFAULT_CATALOG_TTL};
pub use crate::config::{
    ConfigError, HostConfig, HostDefaults, RetryPolicy, ServerConfig, DEFAULT_TIMEOUT_MS,
    TRANSPORT_STDIO, TRANSPORT_STDIO_HEAVY,
};
pub use crate::connection::{ConnectionState, Dialect, McpConnection};
pub use crate::error::HostError;
pub use crate::model::{
    ClientInfo, ContentItem, InitializeParams, ResourceContent, ResourceDescriptor, ServerInfo,
    ToolDescriptor, ToolResult,
};
pub use crate::mux::ServerNotification;
pub use crate::protocol::{
    Envelope, EnvelopeError, RequestId, ResponseOutcome, RpcError, PROTOCOL_VERSION,
};
pub use crate::registry::ServerRegistry;
pub use crate::strategy::{
    ConnectionStrategy, HeavyStartStrategy, StdioStrategy, StrategyRegistry,
};
