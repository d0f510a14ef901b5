//! Marshalling of host tool calls onto the single logical thread.
//!
//! Host worker threads never run tools themselves. They hand a `ToolJob` to
//! the thread that owns conversation state (the orchestrator loop, or
//! `serve_jobs` when the host runs standalone) and block on the reply with a
//! bounded wait.

use crate::tools::{ToolError, ToolRegistry, ToolResult};
use crossbeam::channel::{self, RecvTimeoutError};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Executes a tool on behalf of a host worker thread
pub trait ToolExecutor: Send + Sync {
    /// Blocking call; returns the tool output as a JSON string
    fn execute(&self, name: &str, arguments: Value, timeout: Duration) -> ToolResult<String>;
}

/// One tool execution requested by the host
pub struct ToolJob {
    pub name: String,
    pub arguments: Value,
    pub reply: channel::Sender<ToolResult<String>>,
}

impl std::fmt::Debug for ToolJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolJob").field("name", &self.name).finish()
    }
}

impl ToolJob {
    /// Run against the registry and send the reply; a gone caller is ignored
    pub async fn run(self, registry: &ToolRegistry) {
        debug!(target: "mcp_host", tool = %self.name, "Executing host tool job");
        let result = registry.execute(&self.name, self.arguments).await;
        if self.reply.send(result).is_err() {
            debug!(target: "mcp_host", tool = %self.name, "Caller gave up before the reply");
        }
    }
}

/// Sends jobs to the logical thread through a channel
#[derive(Clone)]
pub struct MainThreadExecutor {
    jobs: UnboundedSender<ToolJob>,
}

impl MainThreadExecutor {
    /// Executor plus the receiver the logical thread must drain
    pub fn new() -> (Self, UnboundedReceiver<ToolJob>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        (Self { jobs }, rx)
    }
}

impl ToolExecutor for MainThreadExecutor {
    fn execute(&self, name: &str, arguments: Value, timeout: Duration) -> ToolResult<String> {
        let (reply, response) = channel::bounded(1);
        self.jobs
            .send(ToolJob {
                name: name.to_string(),
                arguments,
                reply,
            })
            .map_err(|_| ToolError::Internal("tool executor is not running".into()))?;

        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(target: "mcp_host", tool = %name, "Host tool call timed out");
                Err(ToolError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ToolError::Internal("tool job dropped without a reply".into()))
            }
        }
    }
}

/// Drain jobs one at a time until every executor handle is dropped
pub async fn serve_jobs(registry: ToolRegistry, mut jobs: UnboundedReceiver<ToolJob>) {
    while let Some(job) = jobs.recv().await {
        job.run(&registry).await;
    }
    debug!(target: "mcp_host", "Tool job channel closed");
}
