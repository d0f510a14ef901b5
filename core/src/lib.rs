// Weft Core Library
// Conversation orchestration, context budgeting and MCP client/host runtime

pub mod config;
pub mod context;
pub mod conversation;
pub mod host;
pub mod llm;
pub mod mcp;
pub mod persistence;
pub mod telemetry;
pub mod tools;

// Export core types
pub use config::{ContextConfig, HostConfig, LlmClientConfig, OrchestratorConfig, WeftConfig};
pub use context::{ContextWindowManager, ConversationHistory, Message, MessageRole, ToolCall};
pub use conversation::{
    ApprovalMode, ApprovalPolicy, ConversationError, Orchestrator, OrchestratorEvent,
    OrchestratorHandle, OrchestratorState,
};
pub use host::{HostError, HostHandle, MainThreadExecutor, ProtocolHost, ToolExecutor};
pub use llm::{create_client, LlmClient, LlmError};
pub use mcp::{McpError, McpManager, McpServerConfig};
pub use persistence::{FileHistoryStore, HistoryError, HistoryStore, MemoryHistoryStore};
pub use tools::{FnTool, SchemaBuilder, Tool, ToolError, ToolRegistry, ToolSchema};

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

// Error types
#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing credential or server entry; nothing was sent
    Configuration,
    Transport,
    Protocol,
    ToolExecution,
    ResourceExhaustion,
    /// Operation not valid in the current conversation state
    State,
    Storage,
}

impl WeftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeftError::Configuration(_) => ErrorKind::Configuration,
            WeftError::Llm(e) => match e {
                LlmError::MissingCredentials => ErrorKind::Configuration,
                LlmError::Parse(_) => ErrorKind::Protocol,
                LlmError::Status { status: 429, .. } => ErrorKind::ResourceExhaustion,
                _ => ErrorKind::Transport,
            },
            WeftError::Tool(_) => ErrorKind::ToolExecution,
            WeftError::Mcp(e) => match e {
                McpError::Configuration(_) => ErrorKind::Configuration,
                McpError::Protocol(_) | McpError::ServerError { .. } | McpError::Json(_) => {
                    ErrorKind::Protocol
                }
                McpError::ToolNotFound(_) => ErrorKind::ToolExecution,
                McpError::Transport(_) | McpError::Timeout(_) | McpError::Closed | McpError::Io(_) => {
                    ErrorKind::Transport
                }
            },
            WeftError::Host(e) => match e {
                HostError::Malformed(_) => ErrorKind::Protocol,
                HostError::BodyTooLarge(_) => ErrorKind::ResourceExhaustion,
                HostError::Bind { .. } | HostError::Io(_) => ErrorKind::Transport,
            },
            WeftError::History(_) => ErrorKind::Storage,
            WeftError::Conversation(e) => match e {
                ConversationError::MissingCredentials => ErrorKind::Configuration,
                _ => ErrorKind::State,
            },
            WeftError::Io(_) => ErrorKind::Transport,
            WeftError::Serialization(_) => ErrorKind::Protocol,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

/// Composition root: owns the tool registry, the remote server manager and
/// the protocol host, and wires an orchestrator to them.
pub struct Weft {
    config: WeftConfig,
    registry: ToolRegistry,
    mcp: Arc<McpManager>,
    host: Option<HostHandle>,
}

impl Weft {
    pub fn new(config: WeftConfig) -> Self {
        let registry = ToolRegistry::with_timeout(config.orchestrator.tool_timeout);
        let mcp = Arc::new(McpManager::new(config.servers.clone()));
        Self {
            config,
            registry,
            mcp,
            host: None,
        }
    }

    pub fn config(&self) -> &WeftConfig {
        &self.config
    }

    /// Register tools here before calling `start`
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.mcp
    }

    pub fn host(&self) -> Option<&HostHandle> {
        self.host.as_ref()
    }

    /// Connect remote servers, start the protocol host if enabled, restore
    /// history and return an orchestrator wired to all of it.
    pub async fn start(&mut self, client: Arc<dyn LlmClient>) -> Result<Orchestrator> {
        info!("Starting Weft...");

        for (server, e) in self.mcp.connect_all().await {
            warn!(target: "mcp_manager", server = %server, error = %e, "Remote server unavailable");
        }

        let window = ContextWindowManager::with_config(self.config.context.clone());
        let mut orchestrator = Orchestrator::new(
            client,
            self.registry.clone(),
            Arc::clone(&self.mcp),
            window,
            self.config.orchestrator.clone(),
        )
        .with_system_prompt(self.config.system_prompt.clone());

        if let Some(path) = &self.config.history_path {
            orchestrator = orchestrator.with_history_store(Arc::new(FileHistoryStore::new(path)));
            orchestrator.load_history().await?;
        }

        if self.config.host.enabled {
            let (executor, jobs) = MainThreadExecutor::new();
            let handle = ProtocolHost::start(
                self.config.host.clone(),
                self.registry.clone(),
                Arc::new(executor),
            )?;
            info!(url = %handle.url(), "Protocol host started");
            self.host = Some(handle);
            orchestrator = orchestrator.with_host_jobs(jobs);
        }

        info!("Weft started successfully");
        Ok(orchestrator)
    }

    pub async fn shutdown(&mut self) {
        info!("Shutting down Weft...");
        if let Some(mut host) = self.host.take() {
            host.shutdown();
        }
        self.mcp.shutdown().await;
        info!("Weft shut down successfully");
    }
}
