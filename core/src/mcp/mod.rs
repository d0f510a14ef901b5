/// Model Context Protocol (MCP) client side
///
/// Connects to remote tool servers, discovers their tools and invokes them.
///
/// Architecture:
/// - `types`: protocol types (JSON-RPC 2.0 based), shared with the host
/// - `pending`: request/response correlation
/// - `transport`: stdio child process and streamable HTTP
/// - `client`: one server connection
/// - `manager`: all configured servers and the remote tool index
pub mod client;
pub mod manager;
pub mod pending;
pub mod transport;
pub mod types;

pub use client::{McpClient, HANDSHAKE_TIMEOUT};
pub use manager::{McpManager, ServerStatus};
pub use pending::PendingRequests;
pub use transport::{HttpTransport, McpTransport, StdioTransport};
pub use types::{
    McpError, McpServerConfig, McpTool, TransportKind, LATEST_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
