//! The protocol host: accept loop, security gates and JSON-RPC routing.

use super::dispatch::ToolExecutor;
use super::http::{parse_request, write_sse_head, HttpRequest, HttpResponse};
use super::session::{SessionStore, SseHub};
use super::HostError;
use crate::config::HostConfig;
use crate::mcp::types::{
    is_supported_version, negotiate_version, CallToolResult, JsonRpcNotification, JsonRpcResponse,
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION_HEADER,
    SESSION_HEADER,
};
use crate::tools::ToolRegistry;
use serde_json::{json, Value};
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MCP_PATH: &str = "/mcp";

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]"];

struct HostShared {
    config: HostConfig,
    registry: ToolRegistry,
    executor: Arc<dyn ToolExecutor>,
    sessions: SessionStore,
    hub: SseHub,
    stop: AtomicBool,
}

/// Serves the local tool registry to other processes over MCP
pub struct ProtocolHost;

impl ProtocolHost {
    /// Bind `127.0.0.1:port` and start the accept thread
    pub fn start(
        config: HostConfig,
        registry: ToolRegistry,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<HostHandle, HostError> {
        let port = config.port;
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .map_err(|source| HostError::Bind { port, source })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(HostShared {
            hub: SseHub::new(config.replay_buffer),
            config,
            registry,
            executor,
            sessions: SessionStore::default(),
            stop: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = std::thread::Builder::new()
            .name("weft-host-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        info!(target: "mcp_host", %addr, "Protocol host listening");
        Ok(HostHandle {
            addr,
            shared,
            accept_thread: Some(accept_thread),
        })
    }
}

/// Running host; shuts down on drop
pub struct HostHandle {
    addr: SocketAddr,
    shared: Arc<HostShared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl HostHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, MCP_PATH)
    }

    /// Push a JSON-RPC notification to every open event stream
    pub fn broadcast(&self, method: &str, params: Option<Value>) -> usize {
        let note = JsonRpcNotification::new(method, params);
        match serde_json::to_string(&note) {
            Ok(data) => self.shared.hub.broadcast(&data),
            Err(e) => {
                warn!(target: "mcp_host", error = %e, "Failed to encode notification");
                0
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.hub.active_count()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        self.shared.hub.close_all();
        self.shared.sessions.clear();
        info!(target: "mcp_host", addr = %self.addr, "Protocol host stopped");
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<HostShared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                let spawned = std::thread::Builder::new()
                    .name("weft-host-conn".into())
                    .spawn(move || handle_connection(stream, peer, shared));
                if let Err(e) = spawned {
                    warn!(target: "mcp_host", error = %e, "Failed to spawn connection thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(target: "mcp_host", error = %e, "Accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!(target: "mcp_host", "Accept loop exited");
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<HostShared>) {
    if let Err(e) = serve_connection(stream, &shared) {
        debug!(target: "mcp_host", %peer, error = %e, "Connection ended with error");
    }
}

fn serve_connection(mut stream: TcpStream, shared: &HostShared) -> Result<(), HostError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let parsed = {
        let mut reader = BufReader::new(stream.try_clone()?);
        parse_request(&mut reader, shared.config.max_body_bytes)
    };
    let request = match parsed {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(HostError::BodyTooLarge(n)) => {
            HttpResponse::text(413, &format!("body of {} bytes exceeds limit", n)).write_to(&mut stream)?;
            return Ok(());
        }
        Err(e) => {
            HttpResponse::text(400, &e.to_string()).write_to(&mut stream)?;
            return Ok(());
        }
    };

    match route(&request, shared) {
        Routed::Respond(response) => response.write_to(&mut stream)?,
        Routed::Stream { session_id } => {
            let last_event_id = request
                .header("last-event-id")
                .and_then(|v| v.trim().parse::<u64>().ok());
            write_sse_head(&mut stream, &cors_headers(&request, shared))?;
            stream.set_read_timeout(None)?;
            shared.hub.attach(stream, session_id, last_event_id);
        }
    }
    Ok(())
}

enum Routed {
    Respond(HttpResponse),
    /// Hand the socket to the SSE hub
    Stream { session_id: Option<String> },
}

#[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path))]
fn route(request: &HttpRequest, shared: &HostShared) -> Routed {
    if request.path != MCP_PATH {
        return Routed::Respond(HttpResponse::text(404, "not found"));
    }
    if !origin_allowed(request.header("origin"), &shared.config.allowed_origins) {
        warn!(target: "mcp_host", origin = ?request.header("origin"), "Rejected origin");
        return Routed::Respond(HttpResponse::text(403, "origin not allowed"));
    }

    let cors = cors_headers(request, shared);
    let with_cors = |mut response: HttpResponse| {
        response.headers.extend(cors.iter().cloned());
        Routed::Respond(response)
    };

    if request.method == "OPTIONS" {
        return with_cors(HttpResponse::empty(204));
    }
    if let Some(expected) = &shared.config.api_key {
        if !api_key_matches(request.header("authorization"), expected) {
            return with_cors(HttpResponse::text(401, "missing or invalid API key"));
        }
    }

    let session_id = request.header(SESSION_HEADER).map(str::to_string);
    if let (Some(sid), Some(version)) = (&session_id, request.header(PROTOCOL_VERSION_HEADER)) {
        if shared.sessions.contains(sid) && !is_supported_version(version) {
            return with_cors(HttpResponse::text(
                400,
                &format!("unsupported protocol version {}", version),
            ));
        }
    }

    match request.method.as_str() {
        "POST" => with_cors(handle_post(request, shared, session_id.as_deref())),
        "GET" => {
            if !request.accepts("text/event-stream") {
                return with_cors(HttpResponse::text(406, "GET requires Accept: text/event-stream"));
            }
            if let Some(sid) = &session_id {
                if !shared.sessions.contains(sid) {
                    return with_cors(HttpResponse::text(404, "unknown session"));
                }
            }
            Routed::Stream { session_id }
        }
        "DELETE" => {
            let response = match &session_id {
                None => HttpResponse::text(400, "missing session header"),
                Some(sid) if shared.sessions.remove(sid) => {
                    shared.hub.close_session(sid);
                    debug!(target: "mcp_host", session = %sid, "Session terminated");
                    HttpResponse::empty(204)
                }
                Some(_) => HttpResponse::text(404, "unknown session"),
            };
            with_cors(response)
        }
        _ => with_cors(
            HttpResponse::text(405, "method not allowed").with_header("Allow", "GET, POST, DELETE, OPTIONS"),
        ),
    }
}

fn handle_post(request: &HttpRequest, shared: &HostShared, session_id: Option<&str>) -> HttpResponse {
    let body: Value = match serde_json::from_slice(&request.body) {
        Ok(v) => v,
        Err(e) => {
            let error = JsonRpcResponse::error(Value::Null, PARSE_ERROR, format!("Parse error: {}", e));
            return HttpResponse::json(400, &json!(error));
        }
    };

    let mut new_session: Option<String> = None;
    let outcome = match body {
        Value::Array(batch) if !batch.is_empty() => {
            let mut replies = Vec::new();
            for item in batch {
                match handle_message(item, shared, session_id, &mut new_session) {
                    Outcome::Reply(r) => replies.push(json!(r)),
                    Outcome::Accepted => {}
                    Outcome::UnknownSession => return HttpResponse::text(404, "unknown session"),
                }
            }
            if replies.is_empty() {
                None
            } else {
                Some(Value::Array(replies))
            }
        }
        single => match handle_message(single, shared, session_id, &mut new_session) {
            Outcome::Reply(r) => Some(json!(r)),
            Outcome::Accepted => None,
            Outcome::UnknownSession => return HttpResponse::text(404, "unknown session"),
        },
    };

    let mut response = match outcome {
        None => HttpResponse::empty(202),
        Some(payload) if request.accepts("text/event-stream") && !request.accepts("application/json") => {
            HttpResponse::sse_once(&payload.to_string())
        }
        Some(payload) => HttpResponse::json(200, &payload),
    };
    if let Some(sid) = new_session {
        response = response.with_header(SESSION_HEADER, sid);
    }
    response
}

enum Outcome {
    Reply(JsonRpcResponse),
    Accepted,
    UnknownSession,
}

fn handle_message(
    message: Value,
    shared: &HostShared,
    session_id: Option<&str>,
    new_session: &mut Option<String>,
) -> Outcome {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(Value::as_str);
    let valid = message.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
    let Some(method) = method.filter(|_| valid) else {
        return Outcome::Reply(JsonRpcResponse::error(
            id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
        ));
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    if method != "initialize" && method != "ping" {
        if let Some(sid) = session_id {
            if !shared.sessions.contains(sid) {
                return Outcome::UnknownSession;
            }
        }
    }

    // Notifications never get a response body
    let Some(id) = id else {
        debug!(target: "mcp_host", method = %method, "Notification accepted");
        return Outcome::Accepted;
    };

    let reply = match method {
        "initialize" => {
            let version = negotiate_version(params.get("protocolVersion").and_then(Value::as_str));
            let session = shared.sessions.create(version);
            info!(target: "mcp_host", session = %session.id, version = %version, "Client initialized");
            *new_session = Some(session.id);
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {
                        "name": shared.config.server_name,
                        "version": shared.config.server_version,
                    }
                }),
            )
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = shared
                .registry
                .list_schemas(false)
                .into_iter()
                .map(|s| json!(s))
                .collect();
            JsonRpcResponse::success(id, json!({ "tools": tools }))
        }
        "tools/call" => call_tool(id, &params, shared),
        other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };
    Outcome::Reply(reply)
}

fn call_tool(id: Value, params: &Value, shared: &HostShared) -> JsonRpcResponse {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "tools/call requires a name");
    };
    if !shared.registry.is_enabled(name) || shared.registry.is_internal(name) {
        return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Unknown tool: {}", name));
    }
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let result = match shared
        .executor
        .execute(name, arguments, shared.config.tool_timeout)
    {
        Ok(text) => CallToolResult::text(text, false),
        Err(e) => {
            warn!(target: "mcp_host", tool = %name, error = %e, "Host tool call failed");
            CallToolResult::text(e.to_string(), true)
        }
    };
    JsonRpcResponse::success(id, json!(result))
}

fn cors_headers(request: &HttpRequest, shared: &HostShared) -> Vec<(String, String)> {
    let Some(origin) = request.header("origin") else {
        return Vec::new();
    };
    if !origin_allowed(Some(origin), &shared.config.allowed_origins) {
        return Vec::new();
    }
    vec![
        ("Access-Control-Allow-Origin".into(), origin.to_string()),
        ("Access-Control-Allow-Methods".into(), "GET, POST, DELETE, OPTIONS".into()),
        (
            "Access-Control-Allow-Headers".into(),
            "Content-Type, Authorization, Mcp-Session-Id, MCP-Protocol-Version, Last-Event-ID".into(),
        ),
        ("Access-Control-Expose-Headers".into(), "Mcp-Session-Id".into()),
        ("Vary".into(), "Origin".into()),
    ]
}

/// Absent, loopback, or explicitly configured origins pass
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if allowed.iter().any(|a| a == origin) {
        return true;
    }
    let authority = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
        .trim_end_matches('/');
    let host = if authority.starts_with('[') {
        authority
            .find(']')
            .map(|end| &authority[..=end])
            .unwrap_or(authority)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    LOOPBACK_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Accepts `Bearer <key>` or the raw key
pub fn api_key_matches(header: Option<&str>, expected: &str) -> bool {
    let Some(value) = header else {
        return false;
    };
    let value = value.trim();
    let presented = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    constant_shape_eq(presented.as_bytes(), expected.as_bytes())
}

/// Compares every byte position regardless of where the first mismatch is
fn constant_shape_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8 | u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}
