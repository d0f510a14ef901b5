//! LLM module: provider-neutral client contract and two HTTP implementations
//!
//! This module provides:
//! - `LlmClient` trait, `ChatRequest`, `StreamEvent`, `FinishReason`
//! - `OpenAiClient` (Chat Completions) and `AnthropicClient` (Messages API)
//! - wire-format adapters for transcript messages and tool schemas

pub mod adapter;
mod anthropic;
mod client;
mod openai;

pub use anthropic::AnthropicClient;
pub use client::{ChatRequest, Completion, FinishReason, LlmClient, LlmError, StreamEvent};
pub use openai::OpenAiClient;

use crate::config::{LlmClientConfig, LlmProvider};
use std::sync::Arc;

/// Build the client for the configured provider
pub fn create_client(cfg: &LlmClientConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    let client: Arc<dyn LlmClient> = match cfg.provider {
        LlmProvider::OpenAi => Arc::new(OpenAiClient::new(cfg.clone())?),
        LlmProvider::Anthropic => Arc::new(AnthropicClient::new(cfg.clone())?),
    };
    Ok(client)
}
