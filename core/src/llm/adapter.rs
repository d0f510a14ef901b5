//! Conversion of transcript messages and tool schemas to provider wire formats.

use crate::context::types::{ContentPart, Message, MessageRole};
use crate::tools::ToolSchema;
use serde_json::{json, Value};

/// Chat Completions `messages` array
pub fn to_openai_messages(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(openai_message).collect()
}

fn openai_message(msg: &Message) -> Value {
    match msg.role {
        MessageRole::System => json!({"role": "system", "content": msg.content}),
        MessageRole::User if msg.has_image() => {
            let parts: Vec<Value> = msg
                .parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image { media_type, data } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
                    }),
                })
                .collect();
            json!({"role": "user", "content": parts})
        }
        MessageRole::User => json!({"role": "user", "content": msg.content}),
        MessageRole::Assistant => {
            let mut out = json!({"role": "assistant"});
            out["content"] = if msg.content.is_empty() && msg.has_tool_calls() {
                Value::Null
            } else {
                Value::String(msg.content.clone())
            };
            if msg.has_tool_calls() {
                out["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments.to_string()}
                        })
                    })
                    .collect();
            }
            out
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
    }
}

/// Chat Completions `tools` array
pub fn to_openai_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

/// Messages API body parts: the joined system prompt and the `messages` array.
///
/// Tool results become `tool_result` blocks inside a user turn; consecutive
/// results are merged into one turn.
pub fn to_anthropic_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<&str> = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role {
            MessageRole::System => system.push(&msg.content),
            MessageRole::User if msg.has_image() => {
                let blocks: Vec<Value> = msg
                    .parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => json!({"type": "text", "text": text}),
                        ContentPart::Image { media_type, data } => json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": media_type, "data": data}
                        }),
                    })
                    .collect();
                out.push(json!({"role": "user", "content": blocks}));
            }
            MessageRole::User => out.push(json!({"role": "user", "content": msg.content})),
            MessageRole::Assistant => {
                if !msg.has_tool_calls() {
                    out.push(json!({"role": "assistant", "content": msg.content}));
                    continue;
                }
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for call in &msg.tool_calls {
                    let input = if call.arguments.is_object() {
                        call.arguments.clone()
                    } else {
                        json!({})
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            MessageRole::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                    "is_error": msg.content.starts_with("Error: "),
                });
                if let Some(blocks) = out.last_mut().and_then(tool_result_turn) {
                    blocks.push(block);
                } else {
                    out.push(json!({"role": "user", "content": [block]}));
                }
            }
        }
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, out)
}

/// The block list of a user turn that already carries tool results
fn tool_result_turn(turn: &mut Value) -> Option<&mut Vec<Value>> {
    if turn["role"] != "user" {
        return None;
    }
    let blocks = turn.get_mut("content")?.as_array_mut()?;
    let is_results = blocks
        .first()
        .map(|b| b["type"] == "tool_result")
        .unwrap_or(false);
    if is_results {
        Some(blocks)
    } else {
        None
    }
}

/// Messages API `tools` array
pub fn to_anthropic_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::{ImageAttachment, ToolCall, ToolResult};

    fn tool_turn() -> Vec<Message> {
        let mut assistant = Message::assistant("");
        assistant.tool_calls = vec![
            ToolCall {
                id: "a".into(),
                name: "read".into(),
                arguments: json!({"path": "x"}),
            },
            ToolCall {
                id: "b".into(),
                name: "read".into(),
                arguments: json!({"path": "y"}),
            },
        ];
        vec![
            Message::system("be brief"),
            Message::user("read both"),
            assistant,
            Message::tool_result(&ToolResult::success("a", "X")),
            Message::tool_result(&ToolResult::failure("b", "missing")),
        ]
    }

    #[test]
    fn test_openai_shapes() {
        let wire = to_openai_messages(&tool_turn());
        assert_eq!(wire[0]["role"], "system");
        assert!(wire[2]["content"].is_null());
        assert_eq!(wire[2]["tool_calls"][1]["function"]["arguments"], r#"{"path":"y"}"#);
        assert_eq!(wire[4]["role"], "tool");
        assert_eq!(wire[4]["tool_call_id"], "b");
    }

    #[test]
    fn test_anthropic_merges_tool_results() {
        let (system, wire) = to_anthropic_messages(&tool_turn());
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        let results = wire[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["is_error"], true);
    }

    #[test]
    fn test_image_parts() {
        let msg = Message::user_with_image(
            "what",
            ImageAttachment {
                media_type: "image/png".into(),
                data: "QUJD".into(),
            },
        );
        let openai = to_openai_messages(std::slice::from_ref(&msg));
        assert_eq!(
            openai[0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
        let (_, anthropic) = to_anthropic_messages(&[msg]);
        assert_eq!(anthropic[0]["content"][1]["source"]["media_type"], "image/png");
    }
}
