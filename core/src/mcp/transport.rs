//! Transports that carry JSON-RPC messages to a remote tool server.
//!
//! Responses are not returned from `send`; every transport hands them to the
//! shared `PendingRequests` table, from a reader task (stdio) or inline from
//! the HTTP response body.

use super::pending::PendingRequests;
use super::types::{JsonRpcResponse, McpError, McpServerConfig, PROTOCOL_VERSION_HEADER, SESSION_HEADER};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the underlying channel
    async fn start(&self) -> Result<(), McpError>;

    /// Send one JSON-RPC request or notification
    async fn send(&self, message: &Value) -> Result<(), McpError>;

    /// Tear the channel down; outstanding requests fail
    async fn close(&self);

    /// Called once the handshake settled on a version
    fn set_protocol_version(&self, _version: &str) {}
}

/// Route an incoming message to the request waiting on it
pub(crate) fn dispatch_incoming(pending: &PendingRequests, server: &str, message: Value) {
    if let Value::Array(batch) = message {
        for item in batch {
            dispatch_incoming(pending, server, item);
        }
        return;
    }
    let is_response = message.get("result").is_some() || message.get("error").is_some();
    match (message.get("id").and_then(Value::as_u64), is_response) {
        (Some(id), true) => match serde_json::from_value::<JsonRpcResponse>(message) {
            Ok(response) => {
                pending.complete(id, response);
            }
            Err(e) => warn!(target: "mcp_client", server = %server, error = %e, "Malformed response"),
        },
        _ => {
            let method = message.get("method").and_then(Value::as_str).unwrap_or("?");
            debug!(target: "mcp_client", server = %server, method = %method, "Ignoring server-initiated message");
        }
    }
}

/// Child process speaking newline-delimited JSON-RPC on stdin/stdout
pub struct StdioTransport {
    config: McpServerConfig,
    pending: Arc<PendingRequests>,
    process: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl StdioTransport {
    pub fn new(config: McpServerConfig, pending: Arc<PendingRequests>) -> Self {
        Self {
            config,
            pending,
            process: Mutex::new(None),
            stdin: Mutex::new(None),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn start(&self) -> Result<(), McpError> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| McpError::Configuration("stdio server without command".into()))?;

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref env) = self.config.env {
            cmd.envs(env);
        }
        if let Some(ref cwd) = self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(target: "mcp_client", server = %self.config.name, error = %e, "Failed to spawn server process");
            McpError::Transport(format!("Failed to spawn process: {}", e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = self.config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "mcp_client", server = %server, stderr = %line);
                }
            });
        }

        let pending = Arc::clone(&self.pending);
        let server = self.config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(message) => dispatch_incoming(&pending, &server, message),
                    Err(e) => warn!(
                        target: "mcp_client",
                        server = %server,
                        error = %e,
                        line = %line,
                        "Failed to parse JSON-RPC message"
                    ),
                }
            }
            let dropped = pending.fail_all();
            debug!(target: "mcp_client", server = %server, dropped, "Stdout reader exited");
        });

        *self.stdin.lock().await = Some(stdin);
        *self.process.lock().await = Some(child);
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::Closed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.pending.fail_all();
    }
}

/// Streamable HTTP: each message is a POST whose body is JSON or an SSE stream
pub struct HttpTransport {
    url: String,
    server: String,
    headers: Vec<(String, String)>,
    http: Client,
    pending: Arc<PendingRequests>,
    session_id: std::sync::Mutex<Option<String>>,
    protocol_version: std::sync::Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(config: &McpServerConfig, pending: Arc<PendingRequests>) -> Result<Self, McpError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| McpError::Configuration("http server without url".into()))?;
        let http = Client::builder()
            .build()
            .map_err(|e| McpError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            url,
            server: config.name.clone(),
            headers: config
                .headers
                .clone()
                .map(|h| h.into_iter().collect())
                .unwrap_or_default(),
            http,
            pending,
            session_id: std::sync::Mutex::new(None),
            protocol_version: std::sync::Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, &self.url);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }
        let version = self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(version) = version {
            req = req.header(PROTOCOL_VERSION_HEADER, version);
        }
        req
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn start(&self) -> Result<(), McpError> {
        Ok(())
    }

    async fn send(&self, message: &Value) -> Result<(), McpError> {
        let resp = self
            .request(reqwest::Method::POST)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.to_string());
        }

        let status = resp.status();
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_sse {
            let mut stream = resp.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                let event = event.map_err(|e| McpError::Transport(e.to_string()))?;
                trace!(target: "mcp_client", server = %self.server, data = %event.data, "SSE event");
                if event.data.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(message) => dispatch_incoming(&self.pending, &self.server, message),
                    Err(e) => warn!(target: "mcp_client", server = %self.server, error = %e, "Bad SSE data"),
                }
            }
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| McpError::Transport(e.to_string()))?;
            if !body.is_empty() {
                let message: Value = serde_json::from_slice(&body)?;
                dispatch_incoming(&self.pending, &self.server, message);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.session_id().is_some() {
            if let Err(e) = self.request(reqwest::Method::DELETE).send().await {
                debug!(target: "mcp_client", server = %self.server, error = %e, "Session delete failed");
            }
        }
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.pending.fail_all();
    }

    fn set_protocol_version(&self, version: &str) {
        *self.protocol_version.lock().unwrap_or_else(|e| e.into_inner()) = Some(version.to_string());
    }
}
