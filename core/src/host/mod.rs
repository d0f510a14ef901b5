//! Protocol host
//!
//! Exposes the local tool registry to other processes as an MCP server over
//! HTTP on `127.0.0.1`. The accept loop and per-connection workers are plain
//! threads; tool execution is marshalled to the logical thread through
//! `dispatch::ToolExecutor`.

pub mod dispatch;
pub mod http;
pub mod server;
pub mod session;

pub use dispatch::{serve_jobs, MainThreadExecutor, ToolExecutor, ToolJob};
pub use server::{HostHandle, ProtocolHost, MCP_PATH};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request body of {0} bytes exceeds limit")]
    BodyTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
