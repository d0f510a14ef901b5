//! Messages API client (Anthropic).

use super::adapter::{to_anthropic_messages, to_anthropic_tools};
use super::client::{
    next_within, ChatRequest, Completion, FinishReason, LlmClient, LlmError, RequestSlot, StreamEvent,
};
use crate::config::LlmClientConfig;
use crate::context::types::{ToolCall, Usage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    cfg: LlmClientConfig,
    slot: RequestSlot,
}

impl AnthropicClient {
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
        format!("{}/v1/messages", self.cfg.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let (system, messages) = to_anthropic_messages(&request.messages);
        let model = if request.model.is_empty() {
            &self.cfg.model
        } else {
            &request.model
        };
        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.cfg.max_tokens),
            "temperature": request.temperature.unwrap_or(self.cfg.temperature),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(to_anthropic_tools(&request.tools));
        }
        body
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint())
            .header("content-type", "application/json")
            .header("x-api-key", self.cfg.api_key.clone().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    #[tracing::instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    fn send_chat_request(
        &self,
        request: ChatRequest,
    ) -> Result<UnboundedReceiver<StreamEvent>, LlmError> {
        if !self.has_credentials() {
            return Err(LlmError::MissingCredentials);
        }
        let body = self.build_body(&request, true);
        debug!(target: "llm_client", url = %self.endpoint(), "POST messages (stream)");

        let (tx, rx) = mpsc::unbounded_channel();
        let req = self.post(&body);
        let idle = Duration::from_millis(self.cfg.stream_idle_timeout_ms);
        let task = tokio::spawn(async move {
            let sent = match tokio::time::timeout(idle, req.send()).await {
                Ok(sent) => sent,
                Err(_) => {
                    warn!(target: "llm_client", "messages request got no response headers in time");
                    let _ = tx.send(StreamEvent::Error(LlmError::Http(format!(
                        "no response from provider for {} ms",
                        idle.as_millis()
                    ))));
                    return;
                }
            };
            match sent {
                Ok(resp) if resp.status().is_success() => handle_anthropic_stream(resp, idle, tx).await,
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(target: "llm_client", status, "messages request failed");
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
            .map_err(|e| LlmError::Parse(format!("Failed to parse messages JSON: {e}")))?;
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

fn parse_completion(val: &Value) -> Result<Completion, LlmError> {
    let blocks = val
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Parse("response has no content".into()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    let usage = val.get("usage").map(|u| Usage {
        prompt_tokens: u["input_tokens"].as_u64().unwrap_or(0),
        completion_tokens: u["output_tokens"].as_u64().unwrap_or(0),
    });
    Ok(Completion {
        text,
        usage,
        finish_reason: val["stop_reason"]
            .as_str()
            .map(FinishReason::from_anthropic)
            .unwrap_or(FinishReason::Stop),
    })
}

struct ToolUseBlock {
    id: String,
    name: String,
    json: String,
}

/// Translate Messages API stream events into stream events
async fn handle_anthropic_stream(
    response: reqwest::Response,
    idle: Duration,
    tx: UnboundedSender<StreamEvent>,
) {
    let mut stream = response.bytes_stream().eventsource();
    let mut blocks: HashMap<u64, ToolUseBlock> = HashMap::new();
    let mut usage = Usage::default();
    let mut finish: Option<FinishReason> = None;

    while let Some(event) = next_within(&mut stream, idle).await {
        let sse = match event {
            Ok(Ok(sse)) => sse,
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
        trace!(target: "llm_client", event = %sse.event, data = %sse.data, "SSE event");

        let data: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "llm_client", error = %e, "Skipping unparsable event");
                continue;
            }
        };
        let index = data["index"].as_u64().unwrap_or(0);

        match sse.event.as_str() {
            "message_start" => {
                if let Some(input) = data.pointer("/message/usage/input_tokens").and_then(Value::as_u64) {
                    usage.prompt_tokens = input;
                }
            }
            "content_block_start" => {
                let block = &data["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        blocks.insert(
                            index,
                            ToolUseBlock {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                json: String::new(),
                            },
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            let _ = tx.send(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            let _ = tx.send(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let (Some(block), Some(part)) =
                            (blocks.get_mut(&index), delta["partial_json"].as_str())
                        {
                            block.json.push_str(part);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(block) = blocks.remove(&index) {
                    let arguments = if block.json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&block.json).unwrap_or(Value::String(block.json))
                    };
                    let _ = tx.send(StreamEvent::ToolCall(ToolCall {
                        id: block.id,
                        name: block.name,
                        arguments,
                    }));
                }
            }
            "message_delta" => {
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    finish = Some(FinishReason::from_anthropic(reason));
                }
                if let Some(output) = data.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    usage.completion_tokens = output;
                }
            }
            "error" => {
                let message = data
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| data.to_string());
                let _ = tx.send(StreamEvent::Error(LlmError::Stream(message)));
                return;
            }
            "message_stop" => break,
            _ => {}
        }
    }

    if usage != Usage::default() {
        let _ = tx.send(StreamEvent::Usage(usage));
    }
    let _ = tx.send(StreamEvent::Done(finish.unwrap_or(FinishReason::Stop)));
}
