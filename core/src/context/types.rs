//! Core conversation types.
//!
//! This module defines the data that flows through the orchestrator:
//! - Message: one entry of the ordered transcript
//! - ToolCall / ToolResult: a model-issued invocation and its outcome
//! - ConversationSummary: the condensed replacement for older turns
//! - UsageStats / TokenBudget: accounting surfaced to the host application
//! - ConversationHistory: the opaque persisted blob

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// Ordered content part of a multimodal message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64-encoded image payload
    Image { media_type: String, data: String },
}

/// Image attached to an outgoing user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

/// A model-issued request to invoke a tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Correlates the call with its result message
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Outcome of a tool invocation, local or remote
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    /// Result JSON on success, error text on failure
    pub content: String,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            content: content.into(),
        }
    }

    pub fn failure(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            content: error.into(),
        }
    }
}

/// One entry of the conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set while chunks are still arriving for this message
    #[serde(default)]
    pub streaming: bool,
    /// Marks the synthetic message that carries the conversation summary
    #[serde(default)]
    pub summary: bool,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            streaming: false,
            summary: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    /// User message with an image; parts carry text first, then the image
    pub fn user_with_image(content: impl Into<String>, image: ImageAttachment) -> Self {
        let content = content.into();
        let mut msg = Self::with_role(MessageRole::User, content.clone());
        if !content.is_empty() {
            msg.parts.push(ContentPart::Text { text: content });
        }
        msg.parts.push(ContentPart::Image {
            media_type: image.media_type,
            data: image.data,
        });
        msg
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// Empty assistant message that receives streamed chunks
    pub fn streaming_placeholder() -> Self {
        let mut msg = Self::with_role(MessageRole::Assistant, String::new());
        msg.streaming = true;
        msg
    }

    /// Exactly one tool-role message per ToolResult
    pub fn tool_result(result: &ToolResult) -> Self {
        let content = if result.success {
            result.content.clone()
        } else {
            format!("Error: {}", result.content)
        };
        let mut msg = Self::with_role(MessageRole::Tool, content);
        msg.tool_call_id = Some(result.tool_call_id.clone());
        msg
    }

    /// Synthetic system message carrying a conversation summary
    pub fn summary_message(summary: &str) -> Self {
        let mut msg = Self::with_role(
            MessageRole::System,
            format!("Summary of the earlier conversation:\n\n{}", summary),
        );
        msg.summary = true;
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn has_image(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. }))
    }

    /// The empty in-progress placeholder that must never be sent to a provider
    pub fn is_empty_placeholder(&self) -> bool {
        self.streaming && self.content.is_empty() && self.tool_calls.is_empty()
    }
}

/// Condensed replacement for older conversation turns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub text: String,
    /// Index (in the pre-summary transcript) of the last message folded into the summary
    pub last_summarized_index: usize,
}

/// Token usage reported by a provider for one request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Cumulative usage counters for a session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub requests: u64,
}

impl UsageStats {
    pub fn record(&mut self, usage: &Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }

    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Estimated context usage shown to the user
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenBudget {
    pub used: usize,
    pub limit: usize,
}

impl TokenBudget {
    pub fn fraction(&self) -> f32 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f32 / self.limit as f32
        }
    }
}

/// Persisted conversation state (treated as an opaque JSON document)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationHistory {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ConversationSummary>,
    #[serde(default)]
    pub usage: UsageStats,
    pub saved_at: DateTime<Utc>,
}

impl ConversationHistory {
    pub fn new(messages: Vec<Message>, model_id: impl Into<String>) -> Self {
        Self {
            messages,
            model_id: model_id.into(),
            summary: None,
            usage: UsageStats::default(),
            saved_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
