//! Window Management
//!
//! Decides which part of the transcript goes out with each request, when the
//! conversation must be summarized, and how a summary replaces older turns.

use crate::config::ContextConfig;
use crate::context::truncation::truncate_middle;
use crate::context::types::{ConversationSummary, Message, MessageRole, TokenBudget};
use crate::context::window::token_counter::{create_counter, TokenCounter};
use crate::llm::ChatRequest;
use std::sync::Arc;
use tracing::{debug, warn};

/// Instruction sent with the dedicated summarization request
pub const SUMMARY_INSTRUCTION: &str = "Summarize the conversation below so that it can replace \
the original messages. Use exactly these sections:\n\
## Goal\n## Key decisions\n## Tool results and facts\n## Open items\n\
Be concise, keep file names, identifiers and numbers verbatim, and do not invent anything.";

/// Result of window selection
#[derive(Debug)]
pub struct WindowSelection {
    /// Messages to send, in chronological order
    pub messages: Vec<Message>,
    /// Estimated tokens of `messages`
    pub tokens_used: usize,
    /// Transcript messages left out of the window
    pub dropped: usize,
    /// Token budget that was available
    pub budget: usize,
}

/// Manages context window selection and summarization for one conversation
pub struct ContextWindowManager {
    counter: Arc<dyn TokenCounter>,
    config: ContextConfig,
}

impl ContextWindowManager {
    pub fn new(counter: Arc<dyn TokenCounter>, config: ContextConfig) -> Self {
        Self { counter, config }
    }

    /// Create with the heuristic counter
    pub fn with_config(config: ContextConfig) -> Self {
        Self::new(create_counter(), config)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ContextConfig) {
        self.config = config;
    }

    /// Tokens a request may spend on input
    pub fn input_budget(&self) -> usize {
        self.config
            .context_length
            .saturating_sub(self.config.reserved_response_tokens)
    }

    pub fn count_message(&self, message: &Message) -> usize {
        self.counter.count_message(message)
    }

    /// Estimated tokens for the system prompt plus the whole transcript
    pub fn estimate_total(&self, system_prompt: &str, transcript: &[Message]) -> usize {
        let system = if system_prompt.is_empty() {
            0
        } else {
            self.counter.count_message(&Message::system(system_prompt))
        };
        system
            + transcript
                .iter()
                .filter(|m| !m.is_empty_placeholder())
                .map(|m| self.counter.count_message(m))
                .sum::<usize>()
    }

    /// Current usage figure for the token-budget display
    pub fn token_budget(&self, system_prompt: &str, transcript: &[Message]) -> TokenBudget {
        TokenBudget {
            used: self.estimate_total(system_prompt, transcript),
            limit: self.config.context_length,
        }
    }

    /// Build the bounded message list for the next request.
    ///
    /// Always starts with the system prompt and, if present, the active summary;
    /// then the newest transcript messages that fit, in chronological order.
    pub fn build_outgoing(
        &self,
        system_prompt: &str,
        transcript: &[Message],
        summary: Option<&ConversationSummary>,
    ) -> WindowSelection {
        let budget = self.input_budget();
        let mut head = Vec::new();
        if !system_prompt.is_empty() {
            head.push(Message::system(system_prompt));
        }
        if let Some(summary) = summary {
            head.push(Message::summary_message(&summary.text));
        }
        let head_tokens = self.fit_head(&mut head, budget);
        let mut remaining = budget.saturating_sub(head_tokens);

        let candidates: Vec<&Message> = transcript
            .iter()
            .filter(|m| !m.is_empty_placeholder() && !m.summary)
            .collect();

        let mut take = 0usize;
        let mut window_tokens = 0usize;
        for msg in candidates.iter().rev() {
            let cost = self.counter.count_message(msg);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            window_tokens += cost;
            take += 1;
        }

        let mut start = candidates.len() - take;
        // A tool result without its assistant tool call is rejected by providers
        while start < candidates.len() && candidates[start].role == MessageRole::Tool {
            window_tokens -= self.counter.count_message(candidates[start]);
            start += 1;
        }

        let dropped = start;
        let mut messages = head;
        messages.extend(candidates[start..].iter().map(|m| (*m).clone()));

        debug!(
            target: "context_window",
            budget,
            included = messages.len(),
            dropped,
            "Built outgoing window"
        );

        WindowSelection {
            messages,
            tokens_used: head_tokens + window_tokens,
            dropped,
            budget,
        }
    }

    /// Shrink the summary, then the system prompt, until the head fits `budget`.
    /// Returns the head's token cost.
    fn fit_head(&self, head: &mut Vec<Message>, budget: usize) -> usize {
        let mut total: usize = head.iter().map(|m| self.counter.count_message(m)).sum();
        if total > budget {
            warn!(
                target: "context_window",
                head_tokens = total,
                budget,
                "System prompt and summary exceed the input budget, truncating"
            );
        }
        while total > budget {
            let Some(last) = head.last() else { break };
            let cost = self.counter.count_message(last);
            let allowed = cost.saturating_sub(total - budget);
            match self.shrink_message(last, allowed) {
                Some(shrunk) => {
                    total = total - cost + self.counter.count_message(&shrunk);
                    if let Some(slot) = head.last_mut() {
                        *slot = shrunk;
                    }
                }
                None => {
                    head.pop();
                    total -= cost;
                }
            }
        }
        total
    }

    /// Head/tail cut of `message` so that it costs at most `max_tokens`, or `None`
    /// if even empty content does not fit
    fn shrink_message(&self, message: &Message, max_tokens: usize) -> Option<Message> {
        let cost = self.counter.count_message(message).max(1);
        let mut max_chars = message.content.len() * max_tokens / cost;
        loop {
            let mut shrunk = message.clone();
            shrunk.content = truncate_middle(&message.content, max_chars);
            if self.counter.count_message(&shrunk) <= max_tokens {
                return Some(shrunk);
            }
            if max_chars == 0 {
                return None;
            }
            max_chars = max_chars * 9 / 10;
        }
    }

    /// Index where the folded range ends and the kept range begins.
    ///
    /// Never lands on a tool result, so a kept result always keeps the assistant
    /// message that issued its call.
    fn summary_cut(&self, transcript: &[Message]) -> usize {
        let mut cut = transcript.len().saturating_sub(self.config.recent_keep);
        while cut > 0 && cut < transcript.len() && transcript[cut].role == MessageRole::Tool {
            cut -= 1;
        }
        cut
    }

    /// True when the transcript crosses `threshold × context_length` and there is
    /// something older than the kept window to fold away
    pub fn needs_summarization(&self, system_prompt: &str, transcript: &[Message]) -> bool {
        if transcript.len() <= self.config.recent_keep {
            return false;
        }
        let limit = (self.config.context_length as f64 * self.config.summarize_threshold) as usize;
        self.estimate_total(system_prompt, transcript) > limit
    }

    /// Dedicated, tool-free, non-streaming request asking for a structured summary
    /// of everything older than the kept window
    pub fn summary_request(
        &self,
        model: &str,
        transcript: &[Message],
        previous: Option<&ConversationSummary>,
    ) -> ChatRequest {
        let cut = self.summary_cut(transcript);
        let mut rendered = String::new();
        if let Some(prev) = previous {
            rendered.push_str("Earlier summary:\n");
            rendered.push_str(&prev.text);
            rendered.push_str("\n\n");
        }
        for msg in transcript[..cut].iter().filter(|m| !m.summary) {
            rendered.push_str(msg.role.as_str());
            if let Some(id) = &msg.tool_call_id {
                rendered.push_str(&format!(" ({})", id));
            }
            rendered.push_str(": ");
            rendered.push_str(&msg.content);
            for call in &msg.tool_calls {
                rendered.push_str(&format!("\n[tool call {} {}]", call.name, call.arguments));
            }
            rendered.push('\n');
        }

        ChatRequest {
            model: model.to_string(),
            messages: vec![Message::system(SUMMARY_INSTRUCTION), Message::user(rendered)],
            tools: Vec::new(),
            max_tokens: Some(self.config.summary_max_tokens),
            temperature: Some(0.2),
        }
    }

    /// Replace all but the last `recent_keep` messages with one synthetic summary message.
    /// The kept range grows backward to include the call that owns a kept tool result.
    pub fn apply_summary(&self, transcript: &mut Vec<Message>, text: &str) -> ConversationSummary {
        let cut = self.summary_cut(transcript);
        let kept = transcript.split_off(cut);
        transcript.clear();
        transcript.push(Message::summary_message(text));
        transcript.extend(kept);

        ConversationSummary {
            text: text.to_string(),
            last_summarized_index: cut.saturating_sub(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::{ToolCall, ToolResult};
    use serde_json::json;

    fn config(context_length: usize, reserved: usize, keep: usize) -> ContextConfig {
        ContextConfig {
            context_length,
            reserved_response_tokens: reserved,
            recent_keep: keep,
            ..ContextConfig::default()
        }
    }

    fn transcript(n: usize, words: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let text = format!("message {} {}", i, "lorem ipsum ".repeat(words));
                if i % 2 == 0 {
                    Message::user(text)
                } else {
                    Message::assistant(text)
                }
            })
            .collect()
    }

    #[test]
    fn test_window_never_exceeds_budget() {
        for context_length in [300usize, 700, 1500, 5000] {
            let manager = ContextWindowManager::with_config(config(context_length, 100, 10));
            let messages = transcript(60, 15);
            let selection = manager.build_outgoing("You are helpful.", &messages, None);
            let total: usize = selection
                .messages
                .iter()
                .map(|m| manager.count_message(m))
                .sum();
            assert!(total <= manager.input_budget(), "{} > {}", total, manager.input_budget());
            assert_eq!(total, selection.tokens_used);
        }
    }

    #[test]
    fn test_window_keeps_newest_in_order() {
        let manager = ContextWindowManager::with_config(config(600, 100, 10));
        let messages = transcript(40, 10);
        let selection = manager.build_outgoing("sys", &messages, None);

        assert_eq!(selection.messages[0].role, MessageRole::System);
        let body = &selection.messages[1..];
        assert!(!body.is_empty());
        assert_eq!(body.last().unwrap().content, messages.last().unwrap().content);
        let first_idx = messages.len() - body.len();
        for (i, m) in body.iter().enumerate() {
            assert_eq!(m.content, messages[first_idx + i].content);
        }
        assert_eq!(selection.dropped, first_idx);
    }

    #[test]
    fn test_summary_goes_second_and_placeholder_excluded() {
        let manager = ContextWindowManager::with_config(config(10_000, 100, 10));
        let mut messages = vec![Message::summary_message("old"), Message::user("hi")];
        messages.push(Message::streaming_placeholder());
        let summary = ConversationSummary {
            text: "old".into(),
            last_summarized_index: 3,
        };
        let selection = manager.build_outgoing("sys", &messages, Some(&summary));

        assert_eq!(selection.messages.len(), 3);
        assert_eq!(selection.messages[0].content, "sys");
        assert!(selection.messages[1].summary);
        assert_eq!(selection.messages[2].content, "hi");
    }

    #[test]
    fn test_window_does_not_start_with_orphan_tool_result() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "c1".into(),
            name: "search".into(),
            arguments: json!({"q": "lorem ipsum ".repeat(40)}),
        });
        let messages = vec![
            Message::user("lorem ipsum ".repeat(40)),
            assistant,
            Message::tool_result(&ToolResult::success("c1", "short")),
            Message::assistant("done"),
        ];
        let manager = ContextWindowManager::with_config(config(150, 100, 10));
        let selection = manager.build_outgoing("", &messages, None);
        assert!(selection
            .messages
            .first()
            .map(|m| m.role != MessageRole::Tool)
            .unwrap_or(true));
    }

    #[test]
    fn test_needs_summarization_threshold() {
        let manager = ContextWindowManager::with_config(config(2_000, 100, 10));
        assert!(!manager.needs_summarization("", &transcript(5, 200)));
        assert!(manager.needs_summarization("", &transcript(30, 60)));
        assert!(!manager.needs_summarization("", &transcript(12, 1)));
    }

    #[test]
    fn test_apply_summary_keeps_recent_plus_one() {
        let manager = ContextWindowManager::with_config(config(2_000, 100, 4));
        let mut messages = transcript(12, 2);
        let last = messages.last().unwrap().content.clone();
        let summary = manager.apply_summary(&mut messages, "the gist");

        assert_eq!(messages.len(), 5);
        assert!(messages[0].summary);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[4].content, last);
        assert_eq!(summary.last_summarized_index, 7);
    }

    #[test]
    fn test_summary_request_is_tool_free() {
        let manager = ContextWindowManager::with_config(config(2_000, 100, 2));
        let messages = transcript(6, 1);
        let request = manager.summary_request("model-x", &messages, None);
        assert!(request.tools.is_empty());
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages[1].content.contains("message 0"));
        assert!(!request.messages[1].content.contains("message 5"));
    }

    fn tool_turn_transcript() -> Vec<Message> {
        let mut assistant = Message::assistant("");
        for id in ["c1", "c2"] {
            assistant.tool_calls.push(ToolCall {
                id: id.into(),
                name: "lookup".into(),
                arguments: json!({}),
            });
        }
        vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("look both up"),
            assistant,
            Message::tool_result(&ToolResult::success("c1", "RESULT-ONE")),
            Message::tool_result(&ToolResult::success("c2", "RESULT-TWO")),
        ]
    }

    #[test]
    fn test_summary_keeps_tool_results_with_their_call() {
        let manager = ContextWindowManager::with_config(config(10_000, 100, 2));
        let mut messages = tool_turn_transcript();

        let request = manager.summary_request("model-x", &messages, None);
        assert!(request.messages[1].content.contains("look both up"));
        assert!(!request.messages[1].content.contains("RESULT-ONE"));
        assert!(!request.messages[1].content.contains("tool call lookup"));

        let summary = manager.apply_summary(&mut messages, "gist");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].tool_calls.len(), 2);
        assert_eq!(summary.last_summarized_index, 2);

        let selection = manager.build_outgoing("sys", &messages, Some(&summary));
        let contents: Vec<&str> = selection.messages.iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"RESULT-ONE"));
        assert!(contents.contains(&"RESULT-TWO"));
        assert_eq!(selection.messages[2].tool_calls.len(), 2);
    }

    #[test]
    fn test_oversized_system_prompt_is_cut_to_budget() {
        let manager = ContextWindowManager::with_config(config(200, 100, 10));
        let prompt = "word ".repeat(400);
        let selection = manager.build_outgoing(&prompt, &transcript(4, 2), None);

        assert!(selection.tokens_used <= selection.budget);
        assert_eq!(selection.messages[0].role, MessageRole::System);
        assert!(selection.messages[0].content.len() < prompt.len());
        let total: usize = selection.messages.iter().map(|m| manager.count_message(m)).sum();
        assert_eq!(total, selection.tokens_used);
    }

    #[test]
    fn test_oversized_summary_is_cut_before_system_prompt() {
        let manager = ContextWindowManager::with_config(config(300, 100, 10));
        let summary = ConversationSummary {
            text: "fact ".repeat(600),
            last_summarized_index: 10,
        };
        let selection = manager.build_outgoing("Be brief.", &[Message::user("hi")], Some(&summary));

        assert!(selection.tokens_used <= selection.budget);
        assert_eq!(selection.messages[0].content, "Be brief.");
        assert!(selection.messages[1].summary);
        assert!(selection.messages[1].content.len() < summary.text.len());
    }
}
