//! Token Counting
//!
//! Heuristic token estimation for context window management. This is not a
//! tokenizer: text is classified by structural density and divided by a
//! chars-per-token ratio for that class.

use crate::context::types::{ContentPart, Message};
use std::sync::Arc;

/// Chars per token for JSON-like payloads
pub const JSON_CHARS_PER_TOKEN: f64 = 2.2;
/// Chars per token for source code
pub const CODE_CHARS_PER_TOKEN: f64 = 2.8;
/// Chars per token for technical prose
pub const TECHNICAL_CHARS_PER_TOKEN: f64 = 3.5;
/// Chars per token for natural prose
pub const PROSE_CHARS_PER_TOKEN: f64 = 4.5;

/// Flat cost charged for an attached image
pub const IMAGE_TOKENS: usize = 1000;
/// Role and separator framing per message
pub const MESSAGE_FRAMING_TOKENS: usize = 4;

/// Structural class of a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Json,
    Code,
    Technical,
    Prose,
}

impl TextKind {
    pub fn chars_per_token(&self) -> f64 {
        match self {
            TextKind::Json => JSON_CHARS_PER_TOKEN,
            TextKind::Code => CODE_CHARS_PER_TOKEN,
            TextKind::Technical => TECHNICAL_CHARS_PER_TOKEN,
            TextKind::Prose => PROSE_CHARS_PER_TOKEN,
        }
    }
}

/// Classify text by brace/quote/punctuation ratios, word length and line density
pub fn classify(text: &str) -> TextKind {
    let chars = text.chars().count();
    if chars == 0 {
        return TextKind::Prose;
    }

    let mut braces = 0usize;
    let mut quotes = 0usize;
    let mut code_punct = 0usize;
    let mut newlines = 0usize;
    for c in text.chars() {
        match c {
            '{' | '}' | '[' | ']' => braces += 1,
            '"' => quotes += 1,
            ';' | '(' | ')' | '=' | '<' | '>' | '&' | '|' => code_punct += 1,
            '\n' => newlines += 1,
            _ => {}
        }
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let word_count = words.len().max(1);
    let avg_word_len =
        words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / word_count as f64;

    let n = chars as f64;
    let brace_quote_ratio = (braces + quotes) as f64 / n;
    let punct_ratio = (code_punct + braces) as f64 / n;
    let newline_ratio = newlines as f64 / word_count as f64;

    let trimmed = text.trim_start();
    let looks_like_json = trimmed.starts_with('{') || trimmed.starts_with('[');

    if brace_quote_ratio > 0.12 || (looks_like_json && brace_quote_ratio > 0.05) {
        TextKind::Json
    } else if punct_ratio > 0.04 || (newline_ratio > 0.25 && punct_ratio > 0.015) {
        TextKind::Code
    } else if avg_word_len > 6.5 || newline_ratio > 0.25 {
        TextKind::Technical
    } else {
        TextKind::Prose
    }
}

/// Estimate tokens for text. Deterministic and side-effect free.
///
/// `max(1, ceil(chars / ratio) + overhead)` where overhead is one token per
/// four newlines plus one per twenty words, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    let ratio = classify(text).chars_per_token();
    let base = (chars as f64 / ratio).ceil() as usize;

    let newlines = text.matches('\n').count();
    let words = text.split_whitespace().count();
    let overhead = newlines.div_ceil(4) + words.div_ceil(20);

    (base + overhead).max(1)
}

/// Estimate tokens for a whole message including parts and tool calls
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut total = MESSAGE_FRAMING_TOKENS + estimate_tokens(&message.content);
    for part in &message.parts {
        match part {
            // Text parts duplicate `content`, which is already counted
            ContentPart::Text { .. } => {}
            ContentPart::Image { .. } => total += IMAGE_TOKENS,
        }
    }
    for call in &message.tool_calls {
        total += estimate_tokens(&call.name);
        total += estimate_tokens(&call.arguments.to_string());
    }
    total
}

/// Token counting interface so the window manager can swap estimators
pub trait TokenCounter: Send + Sync {
    /// Count tokens in text
    fn count_text(&self, text: &str) -> usize;

    /// Count tokens for a message
    fn count_message(&self, message: &Message) -> usize;
}

/// Density-classifying estimator
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn count_message(&self, message: &Message) -> usize {
        estimate_message_tokens(message)
    }
}

/// Create the shared default counter
pub fn create_counter() -> Arc<dyn TokenCounter> {
    Arc::new(HeuristicCounter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::{ImageAttachment, ToolCall};
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(r#"{"name": "value", "items": [1, 2, 3], "nested": {"a": "b"}}"#),
            TextKind::Json
        );
        assert_eq!(
            classify("fn main() {\n    let x = foo(a, b);\n    if x > 3 { bar(); }\n}\n"),
            TextKind::Code
        );
        assert_eq!(
            classify("The quick brown fox jumps over the lazy dog and keeps on running"),
            TextKind::Prose
        );
        assert_eq!(
            classify("Serialization configuration initialization requires authentication middleware"),
            TextKind::Technical
        );
    }

    #[test]
    fn test_estimate_is_deterministic_and_positive() {
        assert_eq!(estimate_tokens(""), 1);
        let text = "Hello, world! This is a test.";
        assert_eq!(estimate_tokens(text), estimate_tokens(text));
        assert!(estimate_tokens(text) >= 1);
    }

    #[test]
    fn test_json_is_denser_than_prose() {
        let prose = "the cat sat on the mat and looked around the room ".repeat(20);
        let json = serde_json::to_string(&json!({
            "items": (0..60).map(|i| json!({"id": i, "k": "v"})).collect::<Vec<_>>()
        }))
        .unwrap();
        let prose_ratio = prose.chars().count() as f64 / estimate_tokens(&prose) as f64;
        let json_ratio = json.chars().count() as f64 / estimate_tokens(&json) as f64;
        assert!(json_ratio < prose_ratio);
    }

    #[test]
    fn test_prose_estimate_matches_formula() {
        // 40 chars, 8 words, no newlines: ceil(40 / 4.5) = 9, overhead ceil(8/20) = 1
        let text = "aaaa bbbb cccc dddd eeee ffff gggg hhhh.";
        assert_eq!(text.chars().count(), 40);
        assert_eq!(classify(text), TextKind::Prose);
        assert_eq!(estimate_tokens(text), 10);
    }

    #[test]
    fn test_message_estimate_includes_tool_calls_and_images() {
        let plain = Message::user("look at this");
        let with_image = Message::user_with_image(
            "look at this",
            ImageAttachment {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            },
        );
        assert_eq!(
            estimate_message_tokens(&with_image),
            estimate_message_tokens(&plain) + IMAGE_TOKENS
        );

        let mut call = Message::assistant("");
        call.tool_calls.push(ToolCall {
            id: "1".into(),
            name: "search".into(),
            arguments: json!({"query": "tokio"}),
        });
        assert!(estimate_message_tokens(&call) > estimate_message_tokens(&Message::assistant("")));
    }
}
