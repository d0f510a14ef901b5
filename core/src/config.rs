//! Runtime configuration.
//!
//! Every section defaults from environment variables with fallbacks, so a bare
//! `WeftConfig::default()` is usable; the demo binary overlays a TOML file on top.

use crate::context::TruncationLimits;
use crate::conversation::approval::{ApprovalMode, ApprovalPolicy};
use crate::mcp::types::McpServerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_string(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "1" || v == "true" || v == "yes" => true,
        Some(v) if v == "0" || v == "false" || v == "no" => false,
        _ => default,
    }
}

/// Language-model provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "open_ai" | "chat.completions" => Ok(LlmProvider::OpenAi),
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Configuration for the language-model client
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub provider: LlmProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Total deadline for non-streaming requests
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest silence tolerated between two chunks of a streamed reply
    pub stream_idle_timeout_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        let provider = env_string("WEFT_LLM_PROVIDER")
            .and_then(|p| p.parse().ok())
            .unwrap_or(LlmProvider::OpenAi);
        let (default_url, default_model, key_var) = match provider {
            LlmProvider::OpenAi => ("https://api.openai.com/v1", "gpt-4o-mini", "OPENAI_API_KEY"),
            LlmProvider::Anthropic => (
                "https://api.anthropic.com",
                "claude-3-5-haiku-latest",
                "ANTHROPIC_API_KEY",
            ),
        };
        Self {
            provider,
            base_url: env_string("WEFT_LLM_BASE_URL").unwrap_or_else(|| default_url.to_string()),
            model: env_string("WEFT_MODEL").unwrap_or_else(|| default_model.to_string()),
            api_key: env_string("WEFT_API_KEY").or_else(|| env_string(key_var)),
            request_timeout_ms: env_parse("WEFT_REQUEST_TIMEOUT_MS", 120_000),
            connect_timeout_ms: env_parse("WEFT_CONNECT_TIMEOUT_MS", 10_000),
            stream_idle_timeout_ms: env_parse("WEFT_STREAM_IDLE_TIMEOUT_MS", 60_000),
            temperature: env_parse("WEFT_TEMPERATURE", 0.7),
            max_tokens: env_parse("WEFT_MAX_TOKENS", 4096),
        }
    }
}

/// Context window and truncation settings
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub context_length: usize,
    pub reserved_response_tokens: usize,
    /// Fraction of `context_length` that triggers summarization
    pub summarize_threshold: f64,
    /// Messages kept verbatim after a summary
    pub recent_keep: usize,
    pub tool_result_max_tokens: usize,
    pub bulk_tool_result_max_tokens: usize,
    pub summary_max_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_length: env_parse("WEFT_CONTEXT_LENGTH", 128_000),
            reserved_response_tokens: env_parse("WEFT_RESERVED_RESPONSE_TOKENS", 4_096),
            summarize_threshold: env_parse("WEFT_SUMMARIZE_THRESHOLD", 0.8),
            recent_keep: env_parse("WEFT_RECENT_KEEP", 10),
            tool_result_max_tokens: env_parse("WEFT_TOOL_RESULT_MAX_TOKENS", 8_000),
            bulk_tool_result_max_tokens: env_parse("WEFT_BULK_TOOL_RESULT_MAX_TOKENS", 20_000),
            summary_max_tokens: env_parse("WEFT_SUMMARY_MAX_TOKENS", 2_048),
        }
    }
}

impl ContextConfig {
    pub fn truncation_limits(&self) -> TruncationLimits {
        TruncationLimits {
            default_max_tokens: self.tool_result_max_tokens,
            bulk_max_tokens: self.bulk_tool_result_max_tokens,
        }
    }
}

/// Orchestrator loop settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Initial ceiling on automatic model requests per user turn
    pub max_iterations: u32,
    /// Absolute ceiling the user can raise the limit to
    pub hard_max_iterations: u32,
    pub approval: ApprovalPolicy,
    pub tool_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut approval = ApprovalPolicy::default();
        if env_flag("WEFT_AUTO_APPROVE", false) {
            approval.mode = ApprovalMode::AutoApprove;
        }
        Self {
            max_iterations: env_parse("WEFT_MAX_ITERATIONS", 25),
            hard_max_iterations: 200,
            approval,
            tool_timeout: Duration::from_secs(env_parse("WEFT_TOOL_TIMEOUT_SECS", 30)),
            event_capacity: 256,
        }
    }
}

/// Protocol host settings
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub enabled: bool,
    /// 0 binds an ephemeral port
    pub port: u16,
    pub api_key: Option<String>,
    /// Extra origins allowed besides loopback
    pub allowed_origins: Vec<String>,
    pub tool_timeout: Duration,
    pub server_name: String,
    pub server_version: String,
    pub max_body_bytes: usize,
    pub replay_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("WEFT_HOST_ENABLED", true),
            port: env_parse("WEFT_HOST_PORT", 0),
            api_key: env_string("WEFT_HOST_API_KEY"),
            allowed_origins: env_string("WEFT_HOST_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            tool_timeout: Duration::from_secs(env_parse("WEFT_HOST_TOOL_TIMEOUT_SECS", 30)),
            server_name: "weft".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            max_body_bytes: 4 * 1024 * 1024,
            replay_buffer: 256,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct WeftConfig {
    pub llm: LlmClientConfig,
    pub context: ContextConfig,
    pub orchestrator: OrchestratorConfig,
    pub host: HostConfig,
    pub servers: Vec<McpServerConfig>,
    pub system_prompt: String,
    pub history_path: Option<PathBuf>,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            llm: LlmClientConfig::default(),
            context: ContextConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            host: HostConfig::default(),
            servers: Vec::new(),
            system_prompt: env_string("WEFT_SYSTEM_PROMPT").unwrap_or_else(|| {
                "You are a capable assistant. Use the available tools when they help.".to_string()
            }),
            history_path: env_string("WEFT_HISTORY_PATH").map(PathBuf::from),
        }
    }
}
