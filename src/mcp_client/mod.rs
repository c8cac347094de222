//! MCP Client: JSON-RPC over stdio to tool server processes.
//!
//! This module handles:
//! - Spawning server processes and the capability handshake
//! - Request/response correlation over process stdio
//! - A per-key connection pool with liveness probes and rebuild backoff
//! - Health reporting and graceful shutdown

pub mod connection;
pub mod errors;
pub mod pool;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use connection::{Connector, StdioConnector, ToolConnection};
pub use errors::McpError;
pub use pool::{ConnectionPool, HealthStatus, ServerHealth};
pub use types::{McpServersConfig, McpToolDefinition, ServerConfig};
