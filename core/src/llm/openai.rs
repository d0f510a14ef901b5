//! Chat Completions client (OpenAI and compatible servers).

use super::adapter::{to_openai_messages, to_openai_tools};
use super::client::{
    next_within, ChatRequest, Completion, FinishReason, LlmClient, LlmError, RequestSlot, StreamEvent,
};
use crate::config::LlmClientConfig;
use crate::context::types::{ToolCall, Usage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

pub struct OpenAiClient {
    http: Client,
    cfg: LlmClientConfig,
    slot: RequestSlot,
}

impl OpenAiClient {
    pub fn new(cfg: LlmClientConfig) -> Result<Self, LlmError> {
        // No total timeout here: it would also cover a long streamed body
        let http = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .build()
            .map_err(|e| LlmError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            cfg,
            slot: RequestSlot::default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            &self.cfg.model
        } else {
            &request.model
        };
        let mut body = json!({
            "model": model,
            "messages": to_openai_messages(&request.messages),
            "max_tokens": request.max_tokens.unwrap_or(self.cfg.max_tokens),
            "temperature": request.temperature.unwrap_or(self.cfg.temperature),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(to_openai_tools(&request.tools));
        }
        body
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.endpoint())
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        req.json(body)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    #[tracing::instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    fn send_chat_request(
        &self,
        request: ChatRequest,
    ) -> Result<UnboundedReceiver<StreamEvent>, LlmError> {
        if !self.has_credentials() {
            return Err(LlmError::MissingCredentials);
        }
        let body = self.build_body(&request, true);
        debug!(target: "llm_client", url = %self.endpoint(), "POST chat.completions (stream)");

        let (tx, rx) = mpsc::unbounded_channel();
        let req = self.post(&body);
        let idle = Duration::from_millis(self.cfg.stream_idle_timeout_ms);
        let task = tokio::spawn(async move {
            let sent = match tokio::time::timeout(idle, req.send()).await {
                Ok(sent) => sent,
                Err(_) => {
                    warn!(target: "llm_client", "chat.completions request got no response headers in time");
                    let _ = tx.send(StreamEvent::Error(LlmError::Http(format!(
                        "no response from provider for {} ms",
                        idle.as_millis()
                    ))));
                    return;
                }
            };
            match sent {
                Ok(resp) if resp.status().is_success() => handle_openai_stream(resp, idle, tx).await,
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(target: "llm_client", status, "chat.completions request failed");
                    let _ = tx.send(StreamEvent::Error(LlmError::Status { status, body }));
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.into()));
                }
            }
        });
        self.slot.start(task.abort_handle());
        Ok(rx)
    }

    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError> {
        if !self.has_credentials() {
            return Err(LlmError::MissingCredentials);
        }
        let body = self.build_body(&request, false);
        let resp = self
            .post(&body)
            .timeout(Duration::from_millis(self.cfg.request_timeout_ms))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let val: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("Failed to parse chat JSON: {e}")))?;
        parse_completion(&val)
    }

    fn cancel_request(&self) {
        if self.slot.cancel() {
            debug!(target: "llm_client", "Cancelled in-flight request");
        }
    }

    fn is_request_in_progress(&self) -> bool {
        self.slot.is_active()
    }

    fn has_credentials(&self) -> bool {
        self.cfg.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    fn model(&self) -> String {
        self.cfg.model.clone()
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("prompt_tokens").and_then(Value::as_u64)?;
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: v
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

fn parse_completion(val: &Value) -> Result<Completion, LlmError> {
    let choice = val
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmError::Parse("response has no choices".into()))?;
    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::from_openai)
        .unwrap_or(FinishReason::Stop);
    Ok(Completion {
        text,
        usage: val.get("usage").and_then(parse_usage),
        finish_reason,
    })
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    fn finish(self) -> ToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.arguments).unwrap_or(Value::String(self.arguments))
        };
        ToolCall {
            id: if self.id.is_empty() {
                format!("call_{}", uuid::Uuid::new_v4().simple())
            } else {
                self.id
            },
            name: self.name,
            arguments,
        }
    }
}

/// Drive an SSE response body to completion, translating chunks to stream events
async fn handle_openai_stream(
    response: reqwest::Response,
    idle: Duration,
    tx: UnboundedSender<StreamEvent>,
) {
    let mut stream = response.bytes_stream().eventsource();
    let mut calls: BTreeMap<u64, PartialToolCall> = BTreeMap::new();
    let mut finish: Option<FinishReason> = None;

    while let Some(event) = next_within(&mut stream, idle).await {
        let event = match event {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                let _ = tx.send(StreamEvent::Error(LlmError::Stream(e.to_string())));
                return;
            }
            Err(e) => {
                warn!(target: "llm_client", error = %e, "Stream went idle");
                let _ = tx.send(StreamEvent::Error(e));
                return;
            }
        };
        if event.data.trim() == "[DONE]" {
            break;
        }
        trace!(target: "llm_client", data = %event.data, "SSE chunk");

        let chunk: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "llm_client", error = %e, "Skipping unparsable chunk");
                continue;
            }
        };
        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            let _ = tx.send(StreamEvent::Error(LlmError::Stream(message)));
            return;
        }
        if let Some(usage) = chunk.get("usage").and_then(parse_usage) {
            let _ = tx.send(StreamEvent::Usage(usage));
        }

        let choices = chunk.get("choices").and_then(Value::as_array);
        for choice in choices.into_iter().flatten() {
            let delta = &choice["delta"];
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    let _ = tx.send(StreamEvent::TextDelta(text.to_string()));
                }
            }
            for tc in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = calls.entry(index).or_default();
                if let Some(id) = tc.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(name) = tc.pointer("/function/name").and_then(Value::as_str) {
                    entry.name.push_str(name);
                }
                if let Some(args) = tc.pointer("/function/arguments").and_then(Value::as_str) {
                    entry.arguments.push_str(args);
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                finish = Some(FinishReason::from_openai(reason));
                for (_, call) in std::mem::take(&mut calls) {
                    let _ = tx.send(StreamEvent::ToolCall(call.finish()));
                }
            }
        }
    }

    for (_, call) in calls {
        let _ = tx.send(StreamEvent::ToolCall(call.finish()));
    }
    let _ = tx.send(StreamEvent::Done(finish.unwrap_or(FinishReason::Stop)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_tool_call_finish() {
        let call = PartialToolCall {
            id: String::new(),
            name: "search".into(),
            arguments: r#"{"q":"x"}"#.into(),
        }
        .finish();
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.arguments, json!({"q": "x"}));

        let broken = PartialToolCall {
            id: "1".into(),
            name: "search".into(),
            arguments: "{\"q\":".into(),
        }
        .finish();
        assert!(broken.arguments.is_string());
    }

    #[test]
    fn test_parse_completion() {
        let val = json!({
            "choices": [{"message": {"content": "## Goal\nx"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3}
        });
        let c = parse_completion(&val).unwrap();
        assert_eq!(c.text, "## Goal\nx");
        assert_eq!(c.finish_reason, FinishReason::Length);
        assert_eq!(c.usage.unwrap().completion_tokens, 3);
        assert!(parse_completion(&json!({})).is_err());
    }

    #[test]
    fn test_body_includes_tools_and_usage_option() {
        let mut cfg = LlmClientConfig::default();
        cfg.api_key = Some("k".into());
        let client = OpenAiClient::new(cfg).unwrap();
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![crate::context::Message::user("hi")],
            tools: vec![crate::tools::SchemaBuilder::new("t", "d").build()],
            max_tokens: None,
            temperature: None,
        };
        let body = client.build_body(&request, true);
        assert_eq!(body["model"], "m");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "t");
        assert!(client.has_credentials());
    }
}
