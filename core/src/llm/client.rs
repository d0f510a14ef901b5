//! The language-model client contract shared by every provider.

use crate::context::types::{Message, ToolCall, Usage};
use crate::tools::ToolSchema;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;

/// One model request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Why the model stopped producing output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    /// Output hit the token limit; the response is incomplete
    Length,
    Other(String),
}

impl FinishReason {
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "tool_use" => FinishReason::ToolCalls,
            "max_tokens" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, FinishReason::Length)
    }
}

/// Incremental output of a streaming request.
///
/// A stream ends with exactly one `Done` or `Error`; tool calls are delivered
/// whole, before `Done`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    Usage(Usage),
    Done(FinishReason),
    Error(LlmError),
}

/// Result of a non-streaming request
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("No API credentials configured")]
    MissingCredentials,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid provider response: {0}")]
    Parse(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::Status { status: 429, .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Http(e.to_string())
    }
}

/// Next item of a streamed reply, or an error once the provider has been silent for `idle`.
///
/// Only the gap between chunks is bounded; a long reply that keeps producing is never cut.
pub(crate) async fn next_within<S>(stream: &mut S, idle: Duration) -> Option<Result<S::Item, LlmError>>
where
    S: Stream + Unpin,
{
    match tokio::time::timeout(idle, stream.next()).await {
        Ok(item) => item.map(Ok),
        Err(_) => Some(Err(LlmError::Stream(format!(
            "no data from provider for {} ms",
            idle.as_millis()
        )))),
    }
}

/// A language-model backend.
///
/// `send_chat_request` starts a streaming request on a background task and
/// returns the event receiver immediately; at most one request is in flight.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn send_chat_request(
        &self,
        request: ChatRequest,
    ) -> Result<UnboundedReceiver<StreamEvent>, LlmError>;

    /// Non-streaming request, used for summarization
    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError>;

    /// Abort the in-flight streaming request, if any
    fn cancel_request(&self);

    fn is_request_in_progress(&self) -> bool;

    fn has_credentials(&self) -> bool;

    fn model(&self) -> String;
}

/// Tracks the background task of the current streaming request
#[derive(Default)]
pub(crate) struct RequestSlot {
    handle: Mutex<Option<AbortHandle>>,
}

impl RequestSlot {
    pub(crate) fn start(&self, handle: AbortHandle) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        let slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_openai("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_openai("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_anthropic("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_anthropic("end_turn"), FinishReason::Stop);
        assert!(FinishReason::Length.is_incomplete());
        assert!(!FinishReason::Other("content_filter".into()).is_incomplete());
    }

    #[tokio::test]
    async fn test_request_slot_cancel() {
        let slot = RequestSlot::default();
        assert!(!slot.is_active());
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        });
        slot.start(task.abort_handle());
        assert!(slot.is_active());
        assert!(slot.cancel());
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!slot.cancel());
    }

    #[tokio::test]
    async fn test_next_within_passes_items_and_detects_silence() {
        let mut busy = futures::stream::iter(vec![1, 2]);
        let idle = Duration::from_millis(50);
        assert!(matches!(next_within(&mut busy, idle).await, Some(Ok(1))));
        assert!(matches!(next_within(&mut busy, idle).await, Some(Ok(2))));
        assert!(next_within(&mut busy, idle).await.is_none());

        let mut quiet = futures::stream::pending::<u8>();
        assert!(matches!(
            next_within(&mut quiet, idle).await,
            Some(Err(LlmError::Stream(_)))
        ));
    }
}
