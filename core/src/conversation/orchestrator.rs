//! Conversation Orchestrator
//!
//! Owns the transcript and drives the request / tool / follow-up cycle on a
//! single logical thread. Everything that completes elsewhere (the model
//! stream, remote tool calls, summarization, host tool jobs, commands from the
//! application) arrives as a message and is processed one at a time by
//! [`Orchestrator::step`].

use super::approval::ApprovalMode;
use super::events::{OrchestratorEvent, OrchestratorState};
use super::handle::{Command, ConversationSnapshot, OrchestratorHandle};
use super::queue::ToolCallQueue;
use super::ConversationError;
use crate::config::OrchestratorConfig;
use crate::context::truncation::truncate_tool_result;
use crate::context::types::{
    ConversationHistory, ConversationSummary, ImageAttachment, Message, TokenBudget, ToolCall,
    ToolResult, UsageStats,
};
use crate::context::ContextWindowManager;
use crate::host::ToolJob;
use crate::llm::{ChatRequest, Completion, FinishReason, LlmClient, LlmError, StreamEvent};
use crate::mcp::McpManager;
use crate::persistence::{HistoryError, HistoryStore};
use crate::tools::ToolRegistry;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Synthetic user message injected when a response was cut off
pub const CONTINUE_PROMPT: &str = "Please continue from where you left off.";
/// Content given to an empty assistant message when its request is cancelled
pub const CANCELLED_PLACEHOLDER: &str = "[Request cancelled]";

/// What an automatic follow-up request carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    /// Tool results were appended; let the model react
    ToolResults,
    /// The last response was cut off for length
    Continuation,
}

/// Work scheduled for the next tick
#[derive(Debug)]
enum Deferred {
    RunNextTool,
    FollowUp(FollowUp),
}

/// Completions reported by tasks the orchestrator spawned
enum Internal {
    RemoteToolFinished {
        epoch: u64,
        name: String,
        result: ToolResult,
    },
    SummaryFinished {
        epoch: u64,
        result: Result<Completion, LlmError>,
    },
}

enum Input {
    Stream(Option<StreamEvent>),
    Internal(Option<Internal>),
    Command(Option<Command>),
    Job(Option<ToolJob>),
}

async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    system_prompt: String,
    client: Arc<dyn LlmClient>,
    registry: ToolRegistry,
    mcp: Arc<McpManager>,
    window: ContextWindowManager,
    history: Option<Arc<dyn HistoryStore>>,

    transcript: Vec<Message>,
    summary: Option<ConversationSummary>,
    usage: UsageStats,
    state: OrchestratorState,

    queue: ToolCallQueue,
    awaiting_approval: Option<ToolCall>,
    /// Index of the assistant message receiving the current stream
    placeholder: Option<usize>,
    stream: Option<mpsc::UnboundedReceiver<StreamEvent>>,

    iterations: u32,
    ceiling: u32,
    cancelled: bool,
    summarizing: bool,
    /// Follow-up that arrived while a summary was being produced
    queued_follow_up: Option<FollowUp>,
    /// Follow-up held back by the iteration ceiling
    pending_resume: Option<FollowUp>,
    deferred: VecDeque<Deferred>,
    /// Bumped on reset so late completions from the old session are ignored
    epoch: u64,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    host_jobs: Option<mpsc::UnboundedReceiver<ToolJob>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        mcp: Arc<McpManager>,
        window: ContextWindowManager,
        config: OrchestratorConfig,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let ceiling = config.max_iterations.min(config.hard_max_iterations);
        Self {
            config,
            system_prompt: String::new(),
            client,
            registry,
            mcp,
            window,
            history: None,
            transcript: Vec::new(),
            summary: None,
            usage: UsageStats::default(),
            state: OrchestratorState::Idle,
            queue: ToolCallQueue::new(),
            awaiting_approval: None,
            placeholder: None,
            stream: None,
            iterations: 0,
            ceiling,
            cancelled: false,
            summarizing: false,
            queued_follow_up: None,
            pending_resume: None,
            deferred: VecDeque::new(),
            epoch: 0,
            internal_tx,
            internal_rx,
            commands: None,
            host_jobs: None,
            events,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Execute protocol-host tool jobs on this loop
    pub fn with_host_jobs(mut self, jobs: mpsc::UnboundedReceiver<ToolJob>) -> Self {
        self.host_jobs = Some(jobs);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn summary(&self) -> Option<&ConversationSummary> {
        self.summary.as_ref()
    }

    pub fn usage(&self) -> UsageStats {
        self.usage
    }

    pub fn token_budget(&self) -> TokenBudget {
        self.window.token_budget(&self.system_prompt, &self.transcript)
    }

    /// Follow-up requests sent since the last user message
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn iteration_ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn is_summarizing(&self) -> bool {
        self.summarizing
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            state: self.state,
            transcript: self.transcript.clone(),
            summary: self.summary.clone(),
            usage: self.usage,
            token_budget: self.token_budget(),
        }
    }

    /// Nothing is in flight and nothing will happen without outside input
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            OrchestratorState::Idle
                | OrchestratorState::WaitingForApproval
                | OrchestratorState::WaitingForUserContinue
                | OrchestratorState::Cancelled
        ) && self.deferred.is_empty()
            && self.stream.is_none()
            && !self.summarizing
            && self.queue.pending() == 0
    }

    fn is_busy(&self) -> bool {
        self.stream.is_some()
            || self.summarizing
            || self.awaiting_approval.is_some()
            || !self.queue.is_drained()
            || !self.deferred.is_empty()
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: OrchestratorState) {
        if self.state != state {
            debug!(target: "orchestrator", from = %self.state, to = %state, "State change");
            self.state = state;
            self.emit(OrchestratorEvent::StateChanged { state });
        }
    }

    fn push_message(&mut self, message: Message) -> usize {
        self.transcript.push(message.clone());
        let index = self.transcript.len() - 1;
        self.emit(OrchestratorEvent::MessageAdded { index, message });
        index
    }

    /// Restore the transcript from the history store, if one is configured
    pub async fn load_history(&mut self) -> Result<bool, HistoryError> {
        let Some(store) = self.history.clone() else {
            return Ok(false);
        };
        let Some(history) = store.load().await? else {
            return Ok(false);
        };
        let mut messages = history.messages;
        messages.retain(|m| !m.is_empty_placeholder());
        for message in &mut messages {
            message.streaming = false;
        }
        info!(target: "orchestrator", messages = messages.len(), "Restored conversation");
        self.transcript = messages;
        self.summary = history.summary;
        self.usage = history.usage;
        self.emit(OrchestratorEvent::TokenBudgetUpdated {
            budget: self.token_budget(),
        });
        Ok(true)
    }

    async fn persist(&self) {
        let Some(store) = self.history.clone() else {
            return;
        };
        let mut history = ConversationHistory::new(
            self.transcript
                .iter()
                .filter(|m| !m.is_empty_placeholder())
                .cloned()
                .collect(),
            self.client.model(),
        );
        history.summary = self.summary.clone();
        history.usage = self.usage;
        if let Err(e) = store.save(&history).await {
            warn!(target: "history", error = %e, "Failed to save conversation history");
        }
    }

    /// Append a user message and start a model request
    pub async fn send_message(
        &mut self,
        text: impl Into<String>,
        image: Option<ImageAttachment>,
    ) -> Result<(), ConversationError> {
        if !self.client.has_credentials() {
            return Err(ConversationError::MissingCredentials);
        }
        if self.is_busy() {
            return Err(ConversationError::Busy);
        }

        let text = text.into();
        let message = match image {
            Some(image) => Message::user_with_image(text, image),
            None => Message::user(text),
        };
        self.cancelled = false;
        self.iterations = 0;
        self.ceiling = self.config.max_iterations.min(self.config.hard_max_iterations);
        self.pending_resume = None;
        self.push_message(message);

        self.start_request().await;
        Ok(())
    }

    async fn start_request(&mut self) {
        let mut tools = self.registry.list_schemas(true);
        for schema in self.mcp.remote_tool_schemas().await {
            if !tools.iter().any(|t| t.name == schema.name) {
                tools.push(schema);
            }
        }

        let selection =
            self.window
                .build_outgoing(&self.system_prompt, &self.transcript, self.summary.as_ref());
        debug!(
            target: "orchestrator",
            messages = selection.messages.len(),
            tokens = selection.tokens_used,
            dropped = selection.dropped,
            tools = tools.len(),
            "Sending model request"
        );
        let request = ChatRequest {
            model: self.client.model(),
            messages: selection.messages,
            tools,
            max_tokens: None,
            temperature: None,
        };

        match self.client.send_chat_request(request) {
            Ok(rx) => {
                self.usage.record_request();
                let index = self.push_message(Message::streaming_placeholder());
                self.placeholder = Some(index);
                self.stream = Some(rx);
                self.set_state(OrchestratorState::AwaitingModelResponse);
            }
            Err(e) => {
                error!(target: "orchestrator", error = %e, "Model request failed to start");
                self.emit(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                self.set_state(OrchestratorState::Idle);
            }
        }
    }

    async fn handle_stream_event(&mut self, event: Option<StreamEvent>) {
        match event {
            Some(StreamEvent::TextDelta(text)) => {
                if let Some(index) = self.placeholder {
                    if let Some(message) = self.transcript.get_mut(index) {
                        message.content.push_str(&text);
                        let message = message.clone();
                        self.emit(OrchestratorEvent::MessageUpdated { index, message });
                    }
                }
            }
            Some(StreamEvent::ToolCall(call)) => {
                debug!(target: "orchestrator", tool = %call.name, id = %call.id, "Tool call received");
                if let Some(message) = self.placeholder.and_then(|i| self.transcript.get_mut(i)) {
                    message.tool_calls.push(call.clone());
                }
                self.queue.push(call);
            }
            Some(StreamEvent::Usage(usage)) => {
                self.usage.record(&usage);
                self.emit(OrchestratorEvent::UsageUpdated { usage: self.usage });
            }
            Some(StreamEvent::Done(reason)) => {
                self.stream = None;
                self.finish_turn(reason).await;
            }
            Some(StreamEvent::Error(e)) => {
                self.stream = None;
                self.fail_turn(e.to_string());
            }
            None => {
                self.stream = None;
                self.fail_turn("Model stream ended before completing".to_string());
            }
        }
    }

    /// Clear the streaming flag; an assistant message with nothing in it is dropped
    fn seal_placeholder(&mut self) {
        let Some(index) = self.placeholder.take() else {
            return;
        };
        let Some(message) = self.transcript.get_mut(index) else {
            return;
        };
        message.streaming = false;
        if message.content.is_empty() && message.tool_calls.is_empty() {
            self.transcript.remove(index);
            self.emit(OrchestratorEvent::MessageRemoved { index });
        } else {
            let message = message.clone();
            self.emit(OrchestratorEvent::MessageUpdated { index, message });
        }
    }

    async fn finish_turn(&mut self, reason: FinishReason) {
        self.seal_placeholder();
        debug!(target: "orchestrator", ?reason, queued = self.queue.len(), "Model response complete");

        if !self.queue.is_empty() {
            self.set_state(OrchestratorState::ExecutingTools);
            self.deferred.push_back(Deferred::RunNextTool);
            return;
        }
        if reason.is_incomplete() && !self.cancelled {
            info!(target: "orchestrator", "Response cut off, continuing automatically");
            self.follow_up(FollowUp::Continuation).await;
            return;
        }

        self.set_state(OrchestratorState::Idle);
        self.persist().await;
        self.emit(OrchestratorEvent::TokenBudgetUpdated {
            budget: self.token_budget(),
        });
        self.maybe_summarize();
    }

    /// Provider or stream failure: no half-written assistant message survives
    fn fail_turn(&mut self, message: String) {
        if let Some(index) = self.placeholder.take() {
            if index < self.transcript.len() {
                self.transcript.remove(index);
                self.emit(OrchestratorEvent::MessageRemoved { index });
            }
        }
        let dropped = self.queue.drain_queued();
        if !dropped.is_empty() {
            debug!(target: "orchestrator", count = dropped.len(), "Discarded tool calls of failed response");
        }
        error!(target: "orchestrator", error = %message, "Model request failed");
        self.emit(OrchestratorEvent::Error { message });
        self.set_state(OrchestratorState::Idle);
    }

    async fn run_next_tool(&mut self) {
        if self.cancelled || self.queue.is_executing() {
            return;
        }
        let Some(call) = self.queue.next_ready() else {
            if self.queue.is_drained() {
                self.tools_drained();
            }
            return;
        };

        if self.config.approval.requires_approval(&call.name) {
            info!(target: "orchestrator", tool = %call.name, "Tool call requires approval");
            self.awaiting_approval = Some(call.clone());
            self.set_state(OrchestratorState::WaitingForApproval);
            self.emit(OrchestratorEvent::ToolCallApprovalRequired { call });
            return;
        }
        self.execute_call(call).await;
    }

    fn tools_drained(&mut self) {
        if self.cancelled {
            return;
        }
        debug!(target: "orchestrator", "All tool calls finished");
        self.maybe_summarize();
        self.deferred.push_back(Deferred::FollowUp(FollowUp::ToolResults));
    }

    /// Local registry first, then remote servers, else a not-found failure
    async fn execute_call(&mut self, call: ToolCall) {
        self.queue.begin();
        self.set_state(OrchestratorState::ExecutingTools);

        if self.registry.find_tool(&call.name).is_some() {
            let result = match self.registry.execute(&call.name, call.arguments.clone()).await {
                Ok(output) => ToolResult::success(&call.id, output),
                Err(e) => ToolResult::failure(&call.id, e.to_string()),
            };
            self.complete_call(&call.name, result);
            return;
        }

        if self.mcp.find_remote_tool(&call.name).await.is_some() {
            debug!(target: "orchestrator", tool = %call.name, "Dispatching remote tool call");
            let mcp = Arc::clone(&self.mcp);
            let tx = self.internal_tx.clone();
            let epoch = self.epoch;
            tokio::spawn(async move {
                let result = mcp.call_tool(&call).await;
                let _ = tx.send(Internal::RemoteToolFinished {
                    epoch,
                    name: call.name,
                    result,
                });
            });
            return;
        }

        warn!(target: "orchestrator", tool = %call.name, "Unknown tool requested by model");
        let result = ToolResult::failure(&call.id, format!("Tool not found: {}", call.name));
        self.complete_call(&call.name, result);
    }

    /// Append the single tool-role message for a call and schedule the next one
    fn complete_call(&mut self, tool_name: &str, mut result: ToolResult) {
        let limits = self.window.config().truncation_limits();
        result.content = truncate_tool_result(&result.content, tool_name, &limits);
        debug!(target: "orchestrator", tool = %tool_name, success = result.success, "Tool call finished");
        self.push_message(Message::tool_result(&result));
        self.queue.finish();
        self.deferred.push_back(Deferred::RunNextTool);
    }

    /// Run the tool call waiting for approval
    pub async fn approve(&mut self) -> Result<(), ConversationError> {
        let Some(call) = self.awaiting_approval.take() else {
            return Err(ConversationError::InvalidState(self.state));
        };
        info!(target: "orchestrator", tool = %call.name, "Tool call approved");
        self.execute_call(call).await;
        Ok(())
    }

    /// Decline the tool call waiting for approval; the model is told
    pub fn reject(&mut self) -> Result<(), ConversationError> {
        let Some(call) = self.awaiting_approval.take() else {
            return Err(ConversationError::InvalidState(self.state));
        };
        info!(target: "orchestrator", tool = %call.name, "Tool call rejected");
        self.queue.begin();
        self.set_state(OrchestratorState::ExecutingTools);
        let result = ToolResult::failure(
            &call.id,
            format!("The user declined to run the tool '{}'.", call.name),
        );
        self.complete_call(&call.name, result);
        Ok(())
    }

    async fn follow_up(&mut self, kind: FollowUp) {
        if self.cancelled {
            debug!(target: "orchestrator", ?kind, "Follow-up suppressed after cancel");
            return;
        }
        if self.summarizing {
            debug!(target: "orchestrator", ?kind, "Summarization in flight, queueing follow-up");
            self.queued_follow_up = Some(kind);
            return;
        }
        if self.iterations >= self.ceiling {
            warn!(
                target: "orchestrator",
                iterations = self.iterations,
                ceiling = self.ceiling,
                "Iteration limit reached"
            );
            self.pending_resume = Some(kind);
            self.set_state(OrchestratorState::WaitingForUserContinue);
            self.emit(OrchestratorEvent::IterationLimitReached {
                iterations: self.iterations,
                ceiling: self.ceiling,
            });
            self.persist().await;
            return;
        }

        self.iterations += 1;
        if kind == FollowUp::Continuation {
            self.push_message(Message::user(CONTINUE_PROMPT));
        }
        self.start_request().await;
    }

    /// Raise the ceiling by half (clamped to the hard maximum) and resume.
    /// The iteration counter keeps its value.
    pub async fn continue_after_limit(&mut self) -> Result<(), ConversationError> {
        if self.state != OrchestratorState::WaitingForUserContinue {
            return Err(ConversationError::InvalidState(self.state));
        }
        let raised = (f64::from(self.ceiling) * 1.5).ceil() as u32;
        self.ceiling = raised.min(self.config.hard_max_iterations);
        info!(
            target: "orchestrator",
            iterations = self.iterations,
            ceiling = self.ceiling,
            "Continuing past iteration limit"
        );
        let kind = self.pending_resume.take().unwrap_or(FollowUp::Continuation);
        self.follow_up(kind).await;
        Ok(())
    }

    /// Abort the in-flight request and suppress follow-ups until the next user message
    pub async fn cancel_request(&mut self) {
        info!(target: "orchestrator", state = %self.state, "Cancelling request");
        self.cancelled = true;
        if self.stream.take().is_some() || self.client.is_request_in_progress() {
            self.client.cancel_request();
        }
        self.deferred.clear();
        self.queued_follow_up = None;
        self.pending_resume = None;

        // Calls that never ran still owe the model exactly one result each
        let mut unresolved = Vec::new();
        if let Some(call) = self.awaiting_approval.take() {
            unresolved.push(call);
        }
        unresolved.extend(self.queue.drain_queued());
        for call in unresolved {
            self.push_message(Message::tool_result(&ToolResult::failure(
                &call.id,
                "Cancelled by user",
            )));
        }

        if let Some(index) = self.placeholder.take() {
            if let Some(message) = self.transcript.get_mut(index) {
                message.streaming = false;
                if message.content.is_empty() && message.tool_calls.is_empty() {
                    message.content = CANCELLED_PLACEHOLDER.to_string();
                }
                let message = message.clone();
                self.emit(OrchestratorEvent::MessageUpdated { index, message });
            }
        }

        self.set_state(OrchestratorState::Cancelled);
        self.persist().await;
    }

    /// Drop the whole conversation and start over
    pub async fn reset_session(&mut self) {
        info!(target: "orchestrator", "Resetting session");
        if self.stream.take().is_some() || self.client.is_request_in_progress() {
            self.client.cancel_request();
        }
        self.epoch += 1;
        self.deferred.clear();
        self.queue = ToolCallQueue::new();
        self.awaiting_approval = None;
        self.placeholder = None;
        self.queued_follow_up = None;
        self.pending_resume = None;
        self.summarizing = false;
        self.cancelled = false;
        self.iterations = 0;
        self.ceiling = self.config.max_iterations.min(self.config.hard_max_iterations);

        self.transcript.clear();
        self.summary = None;
        self.usage.reset();

        self.set_state(OrchestratorState::Idle);
        self.emit(OrchestratorEvent::UsageUpdated { usage: self.usage });
        self.emit(OrchestratorEvent::TokenBudgetUpdated {
            budget: self.token_budget(),
        });
        self.persist().await;
    }

    /// Start a background summary request when the transcript crosses the threshold
    pub fn maybe_summarize(&mut self) -> bool {
        if self.summarizing
            || !self
                .window
                .needs_summarization(&self.system_prompt, &self.transcript)
        {
            return false;
        }

        let request = self.window.summary_request(
            &self.client.model(),
            &self.transcript,
            self.summary.as_ref(),
        );
        info!(
            target: "orchestrator",
            messages = self.transcript.len(),
            "Context threshold crossed, summarizing"
        );
        self.summarizing = true;
        self.emit(OrchestratorEvent::SummarizationStarted);

        let client = Arc::clone(&self.client);
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = client.complete(request).await;
            let _ = tx.send(Internal::SummaryFinished { epoch, result });
        });
        true
    }

    async fn finish_summary(&mut self, result: Result<Completion, LlmError>) {
        self.summarizing = false;
        match result {
            Ok(completion) if !completion.text.trim().is_empty() => {
                if let Some(usage) = completion.usage {
                    self.usage.record(&usage);
                }
                let summary = self
                    .window
                    .apply_summary(&mut self.transcript, completion.text.trim());
                info!(
                    target: "orchestrator",
                    folded = summary.last_summarized_index + 1,
                    remaining = self.transcript.len(),
                    "Conversation summarized"
                );
                self.summary = Some(summary);
                self.emit(OrchestratorEvent::SummarizationCompleted {
                    messages: self.transcript.len(),
                });
                self.persist().await;
                self.emit(OrchestratorEvent::TokenBudgetUpdated {
                    budget: self.token_budget(),
                });
            }
            Ok(_) => {
                warn!(target: "orchestrator", "Summary request returned no text");
                self.emit(OrchestratorEvent::Error {
                    message: "Summarization returned an empty summary".to_string(),
                });
            }
            Err(e) => {
                warn!(target: "orchestrator", error = %e, "Summarization failed");
                self.emit(OrchestratorEvent::Error {
                    message: format!("Summarization failed: {}", e),
                });
            }
        }

        if let Some(kind) = self.queued_follow_up.take() {
            debug!(target: "orchestrator", ?kind, "Replaying follow-up queued during summarization");
            self.follow_up(kind).await;
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::RemoteToolFinished {
                epoch,
                name,
                result,
            } => {
                if epoch != self.epoch {
                    debug!(target: "orchestrator", tool = %name, "Ignoring result from a reset session");
                    return;
                }
                self.complete_call(&name, result);
            }
            Internal::SummaryFinished { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                self.finish_summary(result).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendMessage { text, image, reply } => {
                let result = self.send_message(text, image).await;
                let _ = reply.send(result);
            }
            Command::Cancel => self.cancel_request().await,
            Command::ContinueAfterLimit { reply } => {
                let result = self.continue_after_limit().await;
                let _ = reply.send(result);
            }
            Command::Approve { reply } => {
                let result = self.approve().await;
                let _ = reply.send(result);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject());
            }
            Command::SetApprovalMode(mode) => self.set_approval_mode(mode),
            Command::Reset => self.reset_session().await,
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    pub fn set_approval_mode(&mut self, mode: ApprovalMode) {
        self.config.approval.mode = mode;
    }

    /// Process exactly one input: a deferred action if any, otherwise the next
    /// stream event, internal completion, command or host tool job.
    pub async fn step(&mut self) {
        if let Some(action) = self.deferred.pop_front() {
            match action {
                Deferred::RunNextTool => self.run_next_tool().await,
                Deferred::FollowUp(kind) => self.follow_up(kind).await,
            }
            return;
        }

        let input = tokio::select! {
            biased;
            event = recv_optional(&mut self.stream) => Input::Stream(event),
            internal = self.internal_rx.recv() => Input::Internal(internal),
            command = recv_optional(&mut self.commands) => Input::Command(command),
            job = recv_optional(&mut self.host_jobs) => Input::Job(job),
        };

        match input {
            Input::Stream(event) => self.handle_stream_event(event).await,
            Input::Internal(Some(message)) => self.handle_internal(message).await,
            // We hold a sender, so this channel never closes
            Input::Internal(None) => {}
            Input::Command(Some(command)) => self.handle_command(command).await,
            Input::Command(None) => {
                debug!(target: "orchestrator", "Command channel closed");
                self.commands = None;
            }
            Input::Job(Some(job)) => job.run(&self.registry).await,
            Input::Job(None) => {
                self.host_jobs = None;
            }
        }
    }

    /// Step until nothing is in flight
    pub async fn run_until_settled(&mut self) {
        while !self.is_settled() {
            self.step().await;
        }
    }

    /// Drive the loop until the command channel closes and the conversation settles
    pub async fn run(mut self) {
        info!(target: "orchestrator", "Orchestrator loop started");
        loop {
            if self.commands.is_none() && self.is_settled() {
                break;
            }
            self.step().await;
        }
        self.persist().await;
        info!(target: "orchestrator", "Orchestrator loop stopped");
    }

    /// Move the orchestrator onto its own task and return a handle to it
    pub fn spawn(mut self) -> OrchestratorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(rx);
        let events = self.events.clone();
        let task = tokio::spawn(self.run());
        OrchestratorHandle::new(tx, events, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::persistence::MockHistoryStore;
    use async_trait::async_trait;

    /// Client that answers every request with a single text reply
    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        fn send_chat_request(
            &self,
            request: ChatRequest,
        ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, LlmError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let _ = tx.send(StreamEvent::TextDelta(format!("echo: {}", last)));
            let _ = tx.send(StreamEvent::Done(FinishReason::Stop));
            Ok(rx)
        }

        async fn complete(&self, _request: ChatRequest) -> Result<Completion, LlmError> {
            Err(LlmError::Cancelled)
        }

        fn cancel_request(&self) {}

        fn is_request_in_progress(&self) -> bool {
            false
        }

        fn has_credentials(&self) -> bool {
            true
        }

        fn model(&self) -> String {
            "echo-1".to_string()
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(EchoClient),
            ToolRegistry::new(),
            Arc::new(McpManager::default()),
            ContextWindowManager::with_config(ContextConfig::default()),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_turn_is_saved_after_completion() {
        let mut store = MockHistoryStore::new();
        store
            .expect_save()
            .withf(|h| h.messages.len() == 2 && h.model_id == "echo-1")
            .times(1)
            .returning(|_| Ok(()));

        let mut orch = orchestrator().with_history_store(Arc::new(store));
        orch.send_message("hello", None).await.unwrap();
        orch.run_until_settled().await;

        assert_eq!(orch.state(), OrchestratorState::Idle);
        assert_eq!(orch.transcript()[1].content, "echo: hello");
        assert!(!orch.transcript()[1].streaming);
        assert_eq!(orch.usage().requests, 1);
    }

    #[tokio::test]
    async fn test_load_history_drops_placeholders() {
        let mut store = MockHistoryStore::new();
        store.expect_load().times(1).returning(|| {
            let mut history = ConversationHistory::new(
                vec![Message::user("hi"), Message::streaming_placeholder()],
                "echo-1",
            );
            history.usage.requests = 3;
            Ok(Some(history))
        });

        let mut orch = orchestrator().with_history_store(Arc::new(store));
        assert!(orch.load_history().await.unwrap());
        assert_eq!(orch.transcript().len(), 1);
        assert_eq!(orch.usage().requests, 3);
    }

    #[tokio::test]
    async fn test_busy_while_streaming() {
        let mut orch = orchestrator();
        orch.send_message("one", None).await.unwrap();
        assert!(matches!(
            orch.send_message("two", None).await,
            Err(ConversationError::Busy)
        ));
        orch.run_until_settled().await;
        assert!(orch.send_message("two", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_reject_without_pending_call_is_invalid() {
        let mut orch = orchestrator();
        assert!(matches!(
            orch.reject(),
            Err(ConversationError::InvalidState(OrchestratorState::Idle))
        ));
        assert!(orch.continue_after_limit().await.is_err());
    }
}
