/// MCP Client implementation
///
/// Talks to one remote tool server over a stdio or HTTP transport. Handles the
/// `initialize` handshake, tool discovery with cursor pagination and tool calls,
/// correlating JSON-RPC responses through `PendingRequests`.
use super::pending::PendingRequests;
use super::transport::{HttpTransport, McpTransport, StdioTransport};
use super::types::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Bound on the `initialize` round trip
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// MCP client for communicating with a single MCP server
pub struct McpClient {
    config: McpServerConfig,
    transport: Box<dyn McpTransport>,
    pending: Arc<PendingRequests>,
    request_id: AtomicU64,
    connected: AtomicBool,
    server_info: RwLock<Option<Implementation>>,
    negotiated_version: RwLock<Option<String>>,
    tools: RwLock<Vec<McpTool>>,
}

impl McpClient {
    /// Create a client for a validated configuration; no I/O happens here
    pub fn new(config: McpServerConfig) -> Result<Self, McpError> {
        config.validate()?;
        let pending = Arc::new(PendingRequests::new());
        let transport: Box<dyn McpTransport> = match config.transport() {
            Some(TransportKind::Stdio) => {
                Box::new(StdioTransport::new(config.clone(), Arc::clone(&pending)))
            }
            Some(TransportKind::Http) => Box::new(HttpTransport::new(&config, Arc::clone(&pending))?),
            None => {
                return Err(McpError::Configuration(format!(
                    "server '{}' has no transport",
                    config.name
                )))
            }
        };
        Ok(Self::with_transport(config, transport, pending))
    }

    /// Create a client over an existing transport sharing `pending`
    pub fn with_transport(
        config: McpServerConfig,
        transport: Box<dyn McpTransport>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            config,
            transport,
            pending,
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            server_info: RwLock::new(None),
            negotiated_version: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Start the transport, perform the handshake and discover tools
    pub async fn connect(&self) -> Result<(), McpError> {
        info!(
            target: "mcp_client",
            server = %self.config.name,
            protocol_version = %self.config.protocol_version(),
            "Connecting to MCP server"
        );

        self.transport.start().await?;

        let init = match self.initialize().await {
            Ok(init) => init,
            Err(e) => {
                self.transport.close().await;
                return Err(e);
            }
        };
        if !is_supported_version(&init.protocol_version) {
            self.transport.close().await;
            return Err(McpError::Protocol(format!(
                "server answered unsupported protocol version {}",
                init.protocol_version
            )));
        }
        self.transport.set_protocol_version(&init.protocol_version);
        *self.negotiated_version.write().await = Some(init.protocol_version.clone());
        *self.server_info.write().await = Some(init.server_info.clone());

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::SeqCst);

        let tools = self.list_tools().await?;
        *self.tools.write().await = tools;

        info!(
            target: "mcp_client",
            server = %self.config.name,
            server_name = %init.server_info.name,
            server_version = %init.server_info.version,
            protocol_version = %init.protocol_version,
            "MCP server connected and initialized"
        );
        Ok(())
    }

    /// Disconnect from the MCP server
    pub async fn disconnect(&self) {
        info!(target: "mcp_client", server = %self.config.name, "Disconnecting from MCP server");
        self.connected.store(false, Ordering::SeqCst);
        self.transport.close().await;
    }

    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: self.config.protocol_version().to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: "weft".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .send_request("initialize", Some(json!(params)), HANDSHAKE_TIMEOUT)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Invalid initialize result: {}", e)))
    }

    /// List available tools, following `nextCursor`
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        debug!(target: "mcp_client", server = %self.config.name, "Listing tools");

        let mut all_tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = ListToolsParams { cursor };
            let result = self
                .send_request("tools/list", Some(json!(params)), self.config.call_timeout())
                .await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| McpError::Protocol(format!("Invalid tools/list result: {}", e)))?;
            all_tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(target: "mcp_client", server = %self.config.name, count = all_tools.len(), "Listed tools");
        Ok(all_tools)
    }

    /// Tools discovered during `connect`
    pub async fn tools(&self) -> Vec<McpTool> {
        self.tools.read().await.clone()
    }

    pub async fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().await.clone()
    }

    pub async fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version.read().await.clone()
    }

    /// Call a tool
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<CallToolResult, McpError> {
        debug!(target: "mcp_client", server = %self.config.name, tool = %name, "Calling tool");
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let result = self
            .send_request("tools/call", Some(json!(params)), limit)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Invalid tools/call result: {}", e)))
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.send_request("ping", None, self.config.call_timeout())
            .await
            .map(|_| ())
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let message = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.transport.send(&message).await
    }

    /// Send a JSON-RPC request and wait for its response, bounded by `limit`
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value, McpError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.pending.register(id);
        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;

        let exchange = async {
            self.transport.send(&message).await?;
            rx.await.map_err(|_| McpError::Closed)
        };

        let response = match timeout(limit, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.pending.abandon(id);
                return Err(e);
            }
            Err(_) => {
                self.pending.abandon(id);
                warn!(target: "mcp_client", server = %self.config.name, method = %method, "Request timeout");
                return Err(McpError::Timeout(limit));
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::ServerError {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| McpError::Protocol("Missing result in response".to_string()))
    }
}
