//! Conversation orchestration
//!
//! This module provides:
//! - `Orchestrator`: the state machine that owns the transcript
//! - `ToolCallQueue` and `ApprovalPolicy` for sequential tool execution
//! - `OrchestratorHandle` for driving a spawned orchestrator
//! - `OrchestratorEvent` notifications for the host application

pub mod approval;
pub mod events;
pub mod handle;
pub mod orchestrator;
pub mod queue;

pub use approval::{ApprovalMode, ApprovalPolicy, DEFAULT_APPROVAL_TOOLS};
pub use events::{OrchestratorEvent, OrchestratorState};
pub use handle::{ConversationSnapshot, OrchestratorHandle};
pub use orchestrator::{Orchestrator, CANCELLED_PLACEHOLDER, CONTINUE_PROMPT};
pub use queue::ToolCallQueue;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("No API credentials configured for the language model")]
    MissingCredentials,

    #[error("A request, tool call or summarization is already in progress")]
    Busy,

    #[error("Operation not valid while {0}")]
    InvalidState(OrchestratorState),

    #[error("Orchestrator has stopped")]
    Stopped,
}
