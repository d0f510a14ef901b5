//! Orchestrator states and the events broadcast to the host application.

use crate::context::types::{Message, TokenBudget, ToolCall, UsageStats};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    AwaitingModelResponse,
    ExecutingTools,
    WaitingForApproval,
    WaitingForUserContinue,
    Cancelled,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::AwaitingModelResponse => "awaiting_model_response",
            OrchestratorState::ExecutingTools => "executing_tools",
            OrchestratorState::WaitingForApproval => "waiting_for_approval",
            OrchestratorState::WaitingForUserContinue => "waiting_for_user_continue",
            OrchestratorState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StateChanged { state: OrchestratorState },
    MessageAdded { index: usize, message: Message },
    /// Sent for every streamed chunk and when a message is sealed
    MessageUpdated { index: usize, message: Message },
    MessageRemoved { index: usize },
    ToolCallApprovalRequired { call: ToolCall },
    IterationLimitReached { iterations: u32, ceiling: u32 },
    SummarizationStarted,
    /// `messages` is the transcript length after the summary was applied
    SummarizationCompleted { messages: usize },
    TokenBudgetUpdated { budget: TokenBudget },
    UsageUpdated { usage: UsageStats },
    Error { message: String },
}
