//! Conversation context
//!
//! - **Types**: transcript messages, tool calls/results, summaries and usage
//! - **Window**: token estimation and selection of the outgoing message window
//! - **Truncation**: head/tail trimming of oversized tool output

pub mod truncation;
pub mod types;
pub mod window;

pub use truncation::{truncate_middle, truncate_tool_result, TruncationLimits};
pub use types::{
    ContentPart, ConversationHistory, ConversationSummary, ImageAttachment, Message, MessageRole,
    TokenBudget, ToolCall, ToolResult, Usage, UsageStats,
};
pub use window::{
    estimate_message_tokens, estimate_tokens, ContextWindowManager, HeuristicCounter,
    TokenCounter, WindowSelection,
};
