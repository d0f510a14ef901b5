/// MCP Manager
///
/// Holds the configured remote tool servers, connects each lazily on first
/// use, and keeps an index from tool name to the server that provides it.
use super::client::McpClient;
use super::types::{McpError, McpServerConfig, McpTool, TransportKind};
use crate::context::types::{ToolCall, ToolResult};
use crate::tools::{adapt_arguments, ToolSchema};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Connection summary for one configured server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: &'static str,
    pub connected: bool,
    pub tool_count: usize,
}

/// Responsible for:
/// - Holding configurations for multiple MCP servers
/// - Connecting on first use and discovering their tools
/// - Routing tool calls to the owning server
pub struct McpManager {
    configs: RwLock<HashMap<String, McpServerConfig>>,
    /// Active MCP clients: server_name -> client
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    /// tool name -> (server name, tool)
    tool_index: RwLock<HashMap<String, (String, McpTool)>>,
    /// Serializes connection attempts so a server is spawned once
    connect_lock: Mutex<()>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl McpManager {
    pub fn new(configs: Vec<McpServerConfig>) -> Self {
        let configs = configs.into_iter().map(|c| (c.name.clone(), c)).collect();
        Self {
            configs: RwLock::new(configs),
            clients: RwLock::new(HashMap::new()),
            tool_index: RwLock::new(HashMap::new()),
            connect_lock: Mutex::new(()),
        }
    }

    /// Add a server configuration without connecting
    pub async fn add_server(&self, config: McpServerConfig) -> Result<(), McpError> {
        config.validate()?;
        info!(target: "mcp_manager", server = %config.name, "Adding MCP server");
        self.configs.write().await.insert(config.name.clone(), config);
        Ok(())
    }

    /// Connected client for `server`, connecting it if needed
    pub async fn ensure_connected(&self, server: &str) -> Result<Arc<McpClient>, McpError> {
        if let Some(client) = self.connected_client(server).await {
            return Ok(client);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(client) = self.connected_client(server).await {
            return Ok(client);
        }

        let config = self
            .configs
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::Configuration(format!("no server named '{}'", server)))?;

        let client = Arc::new(McpClient::new(config)?);
        if let Err(e) = client.connect().await {
            error!(target: "mcp_manager", server = %server, error = %e, "Failed to connect");
            return Err(e);
        }

        self.index_tools(server, &client).await;
        self.clients
            .write()
            .await
            .insert(server.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn connected_client(&self, server: &str) -> Option<Arc<McpClient>> {
        self.clients
            .read()
            .await
            .get(server)
            .filter(|c| c.is_connected())
            .cloned()
    }

    async fn index_tools(&self, server: &str, client: &McpClient) {
        let tools = client.tools().await;
        let mut index = self.tool_index.write().await;
        index.retain(|_, (owner, _)| *owner != server);
        for tool in tools {
            if let Some((owner, _)) = index.get(&tool.name) {
                warn!(
                    target: "mcp_manager",
                    tool = %tool.name,
                    server = %server,
                    owner = %owner,
                    "Duplicate remote tool name; keeping first"
                );
                continue;
            }
            index.insert(tool.name.clone(), (server.to_string(), tool));
        }
        info!(target: "mcp_manager", server = %server, tools = index.len(), "Indexed remote tools");
    }

    /// Connect every configured server, returning the failures
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.ensure_connected(&name).await {
                failures.push((name, e));
            }
        }
        failures
    }

    /// Server name and definition of a remote tool
    pub async fn find_remote_tool(&self, name: &str) -> Option<(String, McpTool)> {
        self.tool_index.read().await.get(name).cloned()
    }

    pub async fn remote_tool_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tool_index
            .read()
            .await
            .values()
            .map(|(_, t)| ToolSchema {
                name: t.name.clone(),
                description: t.description.clone().unwrap_or_default(),
                input_schema: t.input_schema.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a remote tool call. Never fails: errors become failure results.
    pub async fn call_tool(&self, call: &ToolCall) -> ToolResult {
        let Some((server, tool)) = self.find_remote_tool(&call.name).await else {
            return ToolResult::failure(&call.id, format!("Tool not found: {}", call.name));
        };

        let client = match self.ensure_connected(&server).await {
            Ok(client) => client,
            Err(e) => {
                return ToolResult::failure(&call.id, format!("Server '{}' unavailable: {}", server, e))
            }
        };

        let arguments = adapt_arguments(&tool.input_schema, call.arguments.clone());
        let limit = client.config().call_timeout();
        debug!(target: "mcp_manager", server = %server, tool = %call.name, "Routing remote tool call");

        match client.call_tool(&call.name, arguments, limit).await {
            Ok(result) if result.is_error => ToolResult::failure(&call.id, result.joined_text()),
            Ok(result) => ToolResult::success(&call.id, result.joined_text()),
            Err(e) => {
                warn!(target: "mcp_manager", server = %server, tool = %call.name, error = %e, "Remote tool call failed");
                if matches!(e, McpError::Closed | McpError::Transport(_)) {
                    client.disconnect().await;
                }
                ToolResult::failure(&call.id, e.to_string())
            }
        }
    }

    /// Disconnect one server and drop its tools from the index
    pub async fn stop_server(&self, server: &str) -> bool {
        let client = self.clients.write().await.remove(server);
        self.tool_index
            .write()
            .await
            .retain(|_, (owner, _)| *owner != server);
        match client {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let clients: Vec<Arc<McpClient>> = self
            .clients
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        self.tool_index.write().await.clear();
        for client in clients {
            client.disconnect().await;
        }
        info!(target: "mcp_manager", "All MCP servers stopped");
    }

    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let configs = self.configs.read().await;
        let clients = self.clients.read().await;
        let index = self.tool_index.read().await;
        let mut out: Vec<ServerStatus> = configs
            .values()
            .map(|cfg| ServerStatus {
                name: cfg.name.clone(),
                transport: match cfg.transport() {
                    Some(TransportKind::Stdio) => "stdio",
                    Some(TransportKind::Http) => "http",
                    None => "none",
                },
                connected: clients
                    .get(&cfg.name)
                    .map(|c| c.is_connected())
                    .unwrap_or(false),
                tool_count: index.values().filter(|(owner, _)| owner == &cfg.name).count(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_config_is_configuration_error() {
        let manager = McpManager::default();
        let err = manager.ensure_connected("ghost").await.err().unwrap();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_remote_tool_is_failure_result() {
        let manager = McpManager::default();
        let call = ToolCall {
            id: "c1".into(),
            name: "nothing".into(),
            arguments: json!({}),
        };
        let result = manager.call_tool(&call).await;
        assert!(!result.success);
        assert_eq!(result.tool_call_id, "c1");
    }

    #[tokio::test]
    async fn test_add_server_validates() {
        let manager = McpManager::default();
        assert!(manager
            .add_server(McpServerConfig::http("bad", "not-a-url"))
            .await
            .is_err());
        manager
            .add_server(McpServerConfig::stdio("fs", "mcp-fs", &[]))
            .await
            .unwrap();
        let servers = manager.list_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].transport, "stdio");
        assert!(!servers[0].connected);
    }
}
