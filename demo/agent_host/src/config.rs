use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use weft_core::config::{ContextConfig, HostConfig, LlmClientConfig, OrchestratorConfig};
use weft_core::{ApprovalMode, McpServerConfig, WeftConfig};

/// Load configuration from a TOML file (path via WEFT_CONFIG or ./weft.toml),
/// overlaying values onto the env-driven defaults.
pub fn load() -> WeftConfig {
    let default = WeftConfig::default();
    let path = std::env::var("WEFT_CONFIG").unwrap_or_else(|_| "weft.toml".into());
    let p = Path::new(&path);
    if !p.exists() {
        tracing::info!(target: "agent_host", path = %path, "No TOML config found; using defaults/env");
        return default;
    }
    match fs::read_to_string(p) {
        Ok(s) => match toml::from_str::<WeftToml>(&s) {
            Ok(t) => t.overlay(default),
            Err(e) => {
                tracing::warn!(target: "agent_host", error = %e, "Failed to parse TOML; using defaults");
                default
            }
        },
        Err(e) => {
            tracing::warn!(target: "agent_host", error = %e, "Failed to read TOML; using defaults");
            default
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct WeftToml {
    pub system_prompt: Option<String>,
    pub history_path: Option<PathBuf>,
    pub llm: Option<LlmToml>,
    pub context: Option<ContextToml>,
    pub orchestrator: Option<OrchestratorToml>,
    pub host: Option<HostToml>,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl WeftToml {
    fn overlay(self, mut base: WeftConfig) -> WeftConfig {
        if let Some(x) = self.system_prompt {
            base.system_prompt = x;
        }
        if let Some(x) = self.history_path {
            base.history_path = Some(x);
        }
        if let Some(l) = self.llm {
            l.apply(&mut base.llm);
        }
        if let Some(c) = self.context {
            c.apply(&mut base.context);
        }
        if let Some(o) = self.orchestrator {
            o.apply(&mut base.orchestrator);
        }
        if let Some(h) = self.host {
            h.apply(&mut base.host);
        }
        for server in self.servers {
            match server.validate() {
                Ok(()) => base.servers.push(server),
                Err(e) => {
                    tracing::warn!(target: "agent_host", server = %server.name, error = %e, "Skipping invalid server entry")
                }
            }
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LlmToml {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub stream_idle_timeout_ms: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}
impl LlmToml {
    fn apply(self, l: &mut LlmClientConfig) {
        if let Some(x) = self.provider {
            match x.parse() {
                Ok(p) => l.provider = p,
                Err(e) => tracing::warn!(target: "agent_host", error = %e, "Ignoring llm.provider"),
            }
        }
        if let Some(x) = self.base_url {
            l.base_url = x;
        }
        if let Some(x) = self.model {
            l.model = x;
        }
        if let Some(x) = self.api_key {
            l.api_key = Some(x);
        }
        if let Some(x) = self.request_timeout_ms {
            l.request_timeout_ms = x;
        }
        if let Some(x) = self.connect_timeout_ms {
            l.connect_timeout_ms = x;
        }
        if let Some(x) = self.stream_idle_timeout_ms {
            l.stream_idle_timeout_ms = x;
        }
        if let Some(x) = self.temperature {
            l.temperature = x;
        }
        if let Some(x) = self.max_tokens {
            l.max_tokens = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ContextToml {
    pub context_length: Option<usize>,
    pub reserved_response_tokens: Option<usize>,
    pub summarize_threshold: Option<f64>,
    pub recent_keep: Option<usize>,
    pub tool_result_max_tokens: Option<usize>,
    pub bulk_tool_result_max_tokens: Option<usize>,
}
impl ContextToml {
    fn apply(self, c: &mut ContextConfig) {
        if let Some(x) = self.context_length {
            c.context_length = x;
        }
        if let Some(x) = self.reserved_response_tokens {
            c.reserved_response_tokens = x;
        }
        if let Some(x) = self.summarize_threshold {
            c.summarize_threshold = x.clamp(0.1, 1.0);
        }
        if let Some(x) = self.recent_keep {
            c.recent_keep = x;
        }
        if let Some(x) = self.tool_result_max_tokens {
            c.tool_result_max_tokens = x;
        }
        if let Some(x) = self.bulk_tool_result_max_tokens {
            c.bulk_tool_result_max_tokens = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct OrchestratorToml {
    pub max_iterations: Option<u32>,
    pub auto_approve: Option<bool>,
    pub approval_tools: Option<Vec<String>>,
    pub tool_timeout_secs: Option<u64>,
}
impl OrchestratorToml {
    fn apply(self, o: &mut OrchestratorConfig) {
        if let Some(x) = self.max_iterations {
            o.max_iterations = x.clamp(1, o.hard_max_iterations);
        }
        if let Some(x) = self.auto_approve {
            o.approval.mode = if x {
                ApprovalMode::AutoApprove
            } else {
                ApprovalMode::Interactive
            };
        }
        if let Some(x) = self.approval_tools {
            o.approval.tools = x.into_iter().filter(|t| !t.is_empty()).collect();
        }
        if let Some(x) = self.tool_timeout_secs {
            o.tool_timeout = Duration::from_secs(x);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct HostToml {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub tool_timeout_secs: Option<u64>,
    pub server_name: Option<String>,
}
impl HostToml {
    fn apply(self, h: &mut HostConfig) {
        if let Some(x) = self.enabled {
            h.enabled = x;
        }
        if let Some(x) = self.port {
            h.port = x;
        }
        if let Some(x) = self.api_key {
            h.api_key = Some(x).filter(|k| !k.is_empty());
        }
        if let Some(x) = self.allowed_origins {
            h.allowed_origins = x;
        }
        if let Some(x) = self.tool_timeout_secs {
            h.tool_timeout = Duration::from_secs(x);
        }
        if let Some(x) = self.server_name {
            h.server_name = x;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_applies_sections() {
        let toml = r#"
            system_prompt = "Be brief."

            [llm]
            provider = "anthropic"
            model = "claude-test"

            [orchestrator]
            max_iterations = 500
            auto_approve = true

            [host]
            enabled = true
            port = 8765

            [[servers]]
            name = "files"
            command = "mcp-files"
            args = ["--root", "."]

            [[servers]]
            name = "broken"
        "#;
        let parsed: WeftToml = toml::from_str(toml).unwrap();
        let cfg = parsed.overlay(WeftConfig::default());

        assert_eq!(cfg.system_prompt, "Be brief.");
        assert_eq!(cfg.llm.model, "claude-test");
        assert_eq!(cfg.orchestrator.max_iterations, cfg.orchestrator.hard_max_iterations);
        assert_eq!(cfg.orchestrator.approval.mode, ApprovalMode::AutoApprove);
        assert!(cfg.host.enabled);
        assert_eq!(cfg.host.port, 8765);
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].args, vec!["--root", "."]);
    }
}
