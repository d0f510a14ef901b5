//! Handle to an orchestrator running on its own task.

use super::approval::ApprovalMode;
use super::events::{OrchestratorEvent, OrchestratorState};
use super::ConversationError;
use crate::context::types::{ConversationSummary, ImageAttachment, Message, TokenBudget, UsageStats};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub(crate) enum Command {
    SendMessage {
        text: String,
        image: Option<ImageAttachment>,
        reply: oneshot::Sender<Result<(), ConversationError>>,
    },
    Cancel,
    ContinueAfterLimit {
        reply: oneshot::Sender<Result<(), ConversationError>>,
    },
    Approve {
        reply: oneshot::Sender<Result<(), ConversationError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), ConversationError>>,
    },
    SetApprovalMode(ApprovalMode),
    Reset,
    Snapshot {
        reply: oneshot::Sender<ConversationSnapshot>,
    },
}

/// Point-in-time copy of the conversation
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub state: OrchestratorState,
    pub transcript: Vec<Message>,
    pub summary: Option<ConversationSummary>,
    pub usage: UsageStats,
    pub token_budget: TokenBudget,
}

pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<OrchestratorEvent>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<OrchestratorEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            events,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<(), ConversationError> {
        self.commands
            .send(command)
            .map_err(|_| ConversationError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConversationError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| ConversationError::Stopped)
    }

    pub async fn send_message(
        &self,
        text: impl Into<String>,
        image: Option<ImageAttachment>,
    ) -> Result<(), ConversationError> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, image, reply })
            .await?
    }

    pub fn cancel_request(&self) -> Result<(), ConversationError> {
        self.send(Command::Cancel)
    }

    pub async fn continue_after_limit(&self) -> Result<(), ConversationError> {
        self.request(|reply| Command::ContinueAfterLimit { reply })
            .await?
    }

    pub async fn approve(&self) -> Result<(), ConversationError> {
        self.request(|reply| Command::Approve { reply }).await?
    }

    pub async fn reject(&self) -> Result<(), ConversationError> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    pub fn set_approval_mode(&self, mode: ApprovalMode) -> Result<(), ConversationError> {
        self.send(Command::SetApprovalMode(mode))
    }

    pub fn reset_session(&self) -> Result<(), ConversationError> {
        self.send(Command::Reset)
    }

    pub async fn snapshot(&self) -> Result<ConversationSnapshot, ConversationError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Close the command channel and wait for the loop to settle and exit
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        let _ = task.await;
    }
}
