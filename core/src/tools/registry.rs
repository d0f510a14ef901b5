use super::arguments::adapt_arguments;
use super::error::{ToolError, ToolResult};
use super::schema::{validate_schema, ToolSchema};
use super::traits::Tool;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default bound on a single tool execution
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Registered {
    tool: Arc<dyn Tool>,
    schema: ToolSchema,
    /// Internal tools are callable but never advertised to remote peers
    internal: bool,
}

/// A registry for managing locally available tools
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Registered>>,
    disabled: Arc<DashSet<String>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            tools: Arc::new(DashMap::new()),
            disabled: Arc::new(DashSet::new()),
            timeout,
        }
    }

    /// Register a new tool
    pub fn register(&self, tool: Arc<dyn Tool>) -> ToolResult<()> {
        self.insert(tool, false)
    }

    /// Register a tool that is hidden from `tools/list`
    pub fn register_internal(&self, tool: Arc<dyn Tool>) -> ToolResult<()> {
        self.insert(tool, true)
    }

    fn insert(&self, tool: Arc<dyn Tool>, internal: bool) -> ToolResult<()> {
        let schema = ToolSchema::from_tool(tool.as_ref());
        validate_schema(&schema.input_schema)?;
        info!(target: "tool_registry", tool = %schema.name, internal, "Registering tool");
        self.tools.insert(
            schema.name.clone(),
            Registered {
                tool,
                schema,
                internal,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(name);
        } else {
            self.disabled.insert(name.to_string());
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.tools.contains_key(name) && !self.disabled.contains(name)
    }

    pub fn is_internal(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.internal).unwrap_or(false)
    }

    /// Schema of an enabled tool, by exact name
    pub fn find_tool(&self, name: &str) -> Option<ToolSchema> {
        if self.disabled.contains(name) {
            return None;
        }
        self.tools.get(name).map(|t| t.schema.clone())
    }

    /// Enabled tool schemas, sorted by name
    pub fn list_schemas(&self, include_internal: bool) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .iter()
            .filter(|t| include_internal || !t.internal)
            .filter(|t| !self.disabled.contains(t.key()))
            .map(|t| t.schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name with timeout, returning its result as a JSON string
    #[tracing::instrument(skip(self, arguments), fields(tool.name = %name))]
    pub async fn execute(&self, name: &str, arguments: Value) -> ToolResult<String> {
        let (tool, schema) = {
            let entry = self
                .tools
                .get(name)
                .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
            (entry.tool.clone(), entry.schema.clone())
        };
        if self.disabled.contains(name) {
            return Err(ToolError::Disabled(name.to_string()));
        }

        let arguments = adapt_arguments(&schema.input_schema, arguments);
        debug!(target: "tool_registry", tool = %name, "Invoking tool");

        let value = match timeout(self.timeout, tool.call(arguments)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(target: "tool_registry", tool = %name, "Tool execution timed out");
                Err(ToolError::Timeout(self.timeout))
            }
        }
        .inspect_err(|e| {
            warn!(target: "tool_registry", tool = %name, error = %e, "Tool execution failed");
        })?;

        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}
