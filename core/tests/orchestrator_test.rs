// Conversation orchestrator scenarios driven by a scripted model

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use weft_core::context::{ConversationHistory, Message, MessageRole, ToolCall};
use weft_core::conversation::{CANCELLED_PLACEHOLDER, CONTINUE_PROMPT};
use weft_core::host::{serve_jobs, MainThreadExecutor};
use weft_core::llm::{ChatRequest, Completion, FinishReason, StreamEvent};
use weft_core::tools::{FnTool, ToolRegistry};
use weft_core::{
    ApprovalMode, ApprovalPolicy, ContextConfig, ContextWindowManager, ConversationError,
    HistoryStore, HostConfig, LlmClient, LlmError, McpManager, McpServerConfig,
    MemoryHistoryStore, Orchestrator, OrchestratorConfig, OrchestratorEvent, OrchestratorState,
    ProtocolHost,
};

/// What the model does for one streaming request
enum Script {
    /// Send these events and close the stream
    Reply(Vec<StreamEvent>),
    /// Send these events and keep the stream open until cancelled
    Hang(Vec<StreamEvent>),
}

/// Model double that plays back scripted responses and records every request
#[derive(Default)]
struct ScriptedClient {
    scripts: Mutex<VecDeque<Script>>,
    completions: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    summary_requests: Mutex<Vec<ChatRequest>>,
    held: Mutex<Vec<UnboundedSender<StreamEvent>>>,
    cancels: AtomicUsize,
    no_credentials: bool,
}

impl ScriptedClient {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    fn with_summaries(scripts: Vec<Script>, summaries: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            completions: Mutex::new(
                summaries
                    .into_iter()
                    .map(|text| {
                        Ok(Completion {
                            text: text.to_string(),
                            usage: None,
                            finish_reason: FinishReason::Stop,
                        })
                    })
                    .collect(),
            ),
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn summary_count(&self) -> usize {
        self.summary_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn send_chat_request(&self, request: ChatRequest) -> Result<UnboundedReceiver<StreamEvent>, LlmError> {
        self.requests.lock().unwrap().push(request);
        let (tx, rx) = mpsc::unbounded_channel();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Reply(text("ok")));
        match script {
            Script::Reply(events) => {
                for event in events {
                    let _ = tx.send(event);
                }
            }
            Script::Hang(events) => {
                for event in events {
                    let _ = tx.send(event);
                }
                self.held.lock().unwrap().push(tx);
            }
        }
        Ok(rx)
    }

    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError> {
        self.summary_requests.lock().unwrap().push(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::Http("no scripted completion".into())))
    }

    fn cancel_request(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.held.lock().unwrap().clear();
    }

    fn is_request_in_progress(&self) -> bool {
        !self.held.lock().unwrap().is_empty()
    }

    fn has_credentials(&self) -> bool {
        !self.no_credentials
    }

    fn model(&self) -> String {
        "scripted-1".to_string()
    }
}

fn text(s: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(s.to_string()),
        StreamEvent::Done(FinishReason::Stop),
    ]
}

fn cut_off(s: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(s.to_string()),
        StreamEvent::Done(FinishReason::Length),
    ]
}

fn calls(list: &[(&str, &str, Value)]) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = list
        .iter()
        .map(|(id, name, args)| {
            StreamEvent::ToolCall(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.clone(),
            })
        })
        .collect();
    events.push(StreamEvent::Done(FinishReason::ToolCalls));
    events
}

fn add_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry
        .register(Arc::new(FnTool::sync(
            "add",
            "Add two integers",
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}
            }),
            |args| Ok(json!(args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0))),
        )))
        .unwrap();
    registry
}

fn orchestrator_config(max_iterations: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        max_iterations,
        hard_max_iterations: 200,
        approval: ApprovalPolicy::auto_approve(),
        tool_timeout: Duration::from_secs(5),
        event_capacity: 1024,
    }
}

fn context_config() -> ContextConfig {
    ContextConfig {
        context_length: 32_000,
        reserved_response_tokens: 1_000,
        summarize_threshold: 0.8,
        recent_keep: 4,
        ..ContextConfig::default()
    }
}

fn build(client: &Arc<ScriptedClient>, registry: ToolRegistry, config: OrchestratorConfig) -> Orchestrator {
    build_with(client, registry, config, context_config(), Arc::new(McpManager::default()))
}

fn build_with(
    client: &Arc<ScriptedClient>,
    registry: ToolRegistry,
    config: OrchestratorConfig,
    context: ContextConfig,
    mcp: Arc<McpManager>,
) -> Orchestrator {
    let client: Arc<dyn LlmClient> = client.clone();
    Orchestrator::new(
        client,
        registry,
        mcp,
        ContextWindowManager::with_config(context),
        config,
    )
    .with_system_prompt("You are a test assistant.")
}

fn drain(events: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn roles(transcript: &[Message]) -> Vec<MessageRole> {
    transcript.iter().map(|m| m.role).collect()
}

#[tokio::test]
async fn test_plain_turn() {
    let client = ScriptedClient::new(vec![Script::Reply(text("hello there"))]);
    let mut orch = build(&client, ToolRegistry::new(), orchestrator_config(25));
    let mut events = orch.subscribe();

    orch.send_message("hi", None).await.unwrap();
    orch.run_until_settled().await;

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert_eq!(roles(orch.transcript()), vec![MessageRole::User, MessageRole::Assistant]);
    assert_eq!(orch.transcript()[1].content, "hello there");
    assert!(!orch.transcript()[1].streaming);

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages[0].role, MessageRole::System);
    assert_eq!(requests[0].messages.last().unwrap().content, "hi");

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::StateChanged { state: OrchestratorState::AwaitingModelResponse }
    )));
    assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::TokenBudgetUpdated { .. })));
}

#[tokio::test]
async fn test_missing_credentials() {
    let client = Arc::new(ScriptedClient {
        no_credentials: true,
        ..ScriptedClient::default()
    });
    let mut orch = build(&client, ToolRegistry::new(), orchestrator_config(25));
    assert_eq!(
        orch.send_message("hi", None).await,
        Err(ConversationError::MissingCredentials)
    );
    assert!(orch.transcript().is_empty());
    assert!(client.requests().is_empty());
}

/// Every tool call gets exactly one tool message, known or not
#[tokio::test]
async fn test_tool_round_trip() {
    let client = ScriptedClient::new(vec![
        Script::Reply(calls(&[
            ("c1", "add", json!({"a": 2, "b": "3"})),
            ("c2", "missing", json!({})),
        ])),
        Script::Reply(text("the sum is 5")),
    ]);
    let mut orch = build(&client, add_registry(), orchestrator_config(25));

    orch.send_message("add 2 and 3", None).await.unwrap();
    orch.run_until_settled().await;

    let transcript = orch.transcript();
    assert_eq!(
        roles(transcript),
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::Assistant
        ]
    );
    assert_eq!(transcript[1].tool_calls.len(), 2);
    assert_eq!(transcript[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(transcript[2].content, "5");
    assert_eq!(transcript[3].tool_call_id.as_deref(), Some("c2"));
    assert_eq!(transcript[3].content, "Error: Tool not found: missing");
    assert_eq!(transcript[4].content, "the sum is 5");

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tools.iter().any(|t| t.name == "add"));
    let tool_messages = requests[1]
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .count();
    assert_eq!(tool_messages, 2);
    assert_eq!(orch.iterations(), 1);
    assert_eq!(orch.state(), OrchestratorState::Idle);
}

/// A cut-off response is continued exactly once while under the ceiling
#[tokio::test]
async fn test_auto_continue_below_ceiling() {
    let client = ScriptedClient::new(vec![
        Script::Reply(cut_off("part one")),
        Script::Reply(text("part two")),
    ]);
    let mut orch = build(&client, ToolRegistry::new(), orchestrator_config(5));

    orch.send_message("write a long answer", None).await.unwrap();
    orch.run_until_settled().await;

    let contents: Vec<&str> = orch.transcript().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["write a long answer", "part one", CONTINUE_PROMPT, "part two"]
    );
    assert_eq!(client.requests().len(), 2);
    assert_eq!(orch.iterations(), 1);
}

/// At the ceiling the loop stops and asks; continuing raises the ceiling by half
#[tokio::test]
async fn test_iteration_ceiling_and_continue() {
    let client = ScriptedClient::new(vec![
        Script::Reply(calls(&[("c1", "add", json!({"a": 1, "b": 1}))])),
        Script::Reply(calls(&[("c2", "add", json!({"a": 2, "b": 2}))])),
        Script::Reply(text("all done")),
    ]);
    let mut orch = build(&client, add_registry(), orchestrator_config(1));
    let mut events = orch.subscribe();

    orch.send_message("loop", None).await.unwrap();
    orch.run_until_settled().await;

    assert_eq!(orch.state(), OrchestratorState::WaitingForUserContinue);
    assert_eq!(client.requests().len(), 2);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        OrchestratorEvent::IterationLimitReached { iterations: 1, ceiling: 1 }
    )));

    orch.continue_after_limit().await.unwrap();
    assert_eq!(orch.iteration_ceiling(), 2);
    orch.run_until_settled().await;

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert_eq!(client.requests().len(), 3);
    assert_eq!(orch.iterations(), 2);
    assert_eq!(orch.transcript().last().unwrap().content, "all done");
}

/// The raised ceiling never passes the hard maximum
#[tokio::test]
async fn test_ceiling_clamped_to_hard_max() {
    let client = ScriptedClient::new(vec![
        Script::Reply(cut_off("a")),
        Script::Reply(cut_off("b")),
        Script::Reply(cut_off("c")),
    ]);
    let config = OrchestratorConfig {
        hard_max_iterations: 2,
        ..orchestrator_config(2)
    };
    let mut orch = build(&client, ToolRegistry::new(), config);

    orch.send_message("go", None).await.unwrap();
    orch.run_until_settled().await;
    assert_eq!(orch.state(), OrchestratorState::WaitingForUserContinue);
    assert_eq!(orch.iterations(), 2);

    orch.continue_after_limit().await.unwrap();
    assert_eq!(orch.iteration_ceiling(), 2);
    assert_eq!(orch.state(), OrchestratorState::WaitingForUserContinue);
    assert_eq!(client.requests().len(), 3);
}

/// Cancelling mid-stream marks the empty reply and stops all automation
#[tokio::test]
async fn test_cancel_mid_stream() {
    let client = ScriptedClient::new(vec![Script::Hang(vec![])]);
    let mut orch = build(&client, add_registry(), orchestrator_config(25));

    orch.send_message("slow question", None).await.unwrap();
    assert_eq!(orch.state(), OrchestratorState::AwaitingModelResponse);
    assert!(orch.transcript()[1].streaming);

    orch.cancel_request().await;

    let reply = &orch.transcript()[1];
    assert_eq!(reply.content, CANCELLED_PLACEHOLDER);
    assert!(!reply.streaming);
    assert_eq!(orch.state(), OrchestratorState::Cancelled);
    assert_eq!(client.cancels.load(Ordering::SeqCst), 1);
    assert!(orch.is_settled());
    assert_eq!(client.requests().len(), 1);

    // A new message starts a fresh turn
    orch.send_message("next", None).await.unwrap();
    orch.run_until_settled().await;
    assert_eq!(orch.state(), OrchestratorState::Idle);
}

/// Text that already arrived survives a cancel
#[tokio::test]
async fn test_cancel_keeps_partial_text() {
    let client = ScriptedClient::new(vec![Script::Hang(vec![StreamEvent::TextDelta(
        "partial".into(),
    )])]);
    let mut orch = build(&client, ToolRegistry::new(), orchestrator_config(25));

    orch.send_message("q", None).await.unwrap();
    orch.step().await;
    assert_eq!(orch.transcript()[1].content, "partial");

    orch.cancel_request().await;
    assert_eq!(orch.transcript()[1].content, "partial");
    assert!(!orch.transcript()[1].streaming);
}

#[tokio::test]
async fn test_stream_error_removes_placeholder() {
    let client = ScriptedClient::new(vec![
        Script::Reply(vec![
            StreamEvent::TextDelta("half an ans".into()),
            StreamEvent::Error(LlmError::Stream("connection reset".into())),
        ]),
        Script::Reply(text("recovered")),
    ]);
    let mut orch = build(&client, ToolRegistry::new(), orchestrator_config(25));
    let mut events = orch.subscribe();

    orch.send_message("hi", None).await.unwrap();
    orch.run_until_settled().await;

    assert_eq!(roles(orch.transcript()), vec![MessageRole::User]);
    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        OrchestratorEvent::Error { message } if message.contains("connection reset")
    )));

    orch.send_message("again", None).await.unwrap();
    orch.run_until_settled().await;
    assert_eq!(orch.transcript().last().unwrap().content, "recovered");
}

fn guarded_registry(ran: Arc<AtomicBool>) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry
        .register(Arc::new(FnTool::sync(
            "shell",
            "Run a shell command",
            json!({"type": "object", "properties": {"cmd": {"type": "string"}}}),
            move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(json!("ran"))
            },
        )))
        .unwrap();
    registry
}

fn interactive_config() -> OrchestratorConfig {
    OrchestratorConfig {
        approval: ApprovalPolicy {
            mode: ApprovalMode::Interactive,
            tools: HashSet::from(["shell".to_string()]),
        },
        ..orchestrator_config(25)
    }
}

#[tokio::test]
async fn test_rejected_call_is_reported_not_run() {
    let ran = Arc::new(AtomicBool::new(false));
    let client = ScriptedClient::new(vec![
        Script::Reply(calls(&[("c1", "shell", json!({"cmd": "rm -rf /tmp/x"}))])),
        Script::Reply(text("understood")),
    ]);
    let mut orch = build(&client, guarded_registry(ran.clone()), interactive_config());
    let mut events = orch.subscribe();

    orch.send_message("clean up", None).await.unwrap();
    orch.run_until_settled().await;

    assert_eq!(orch.state(), OrchestratorState::WaitingForApproval);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        OrchestratorEvent::ToolCallApprovalRequired { call } if call.name == "shell"
    )));
    assert_eq!(orch.send_message("hurry", None).await, Err(ConversationError::Busy));

    orch.reject().unwrap();
    orch.run_until_settled().await;

    assert!(!ran.load(Ordering::SeqCst));
    let tool = &orch.transcript()[2];
    assert_eq!(tool.role, MessageRole::Tool);
    assert!(tool.content.contains("declined"));
    assert_eq!(orch.transcript().last().unwrap().content, "understood");
    assert_eq!(client.requests().len(), 2);
}

#[tokio::test]
async fn test_approved_call_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    let client = ScriptedClient::new(vec![
        Script::Reply(calls(&[("c1", "shell", json!({"cmd": "ls"}))])),
        Script::Reply(text("listed")),
    ]);
    let mut orch = build(&client, guarded_registry(ran.clone()), interactive_config());

    orch.send_message("list files", None).await.unwrap();
    orch.run_until_settled().await;
    orch.approve().await.unwrap();
    orch.run_until_settled().await;

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(orch.transcript()[2].content, "ran");
    assert_eq!(orch.state(), OrchestratorState::Idle);
}

/// Cancelling while a call waits for approval still answers that call
#[tokio::test]
async fn test_cancel_during_approval_resolves_calls() {
    let ran = Arc::new(AtomicBool::new(false));
    let client = ScriptedClient::new(vec![Script::Reply(calls(&[
        ("c1", "shell", json!({"cmd": "ls"})),
        ("c2", "shell", json!({"cmd": "pwd"})),
    ]))]);
    let mut orch = build(&client, guarded_registry(ran.clone()), interactive_config());

    orch.send_message("go", None).await.unwrap();
    orch.run_until_settled().await;
    orch.cancel_request().await;

    let results: Vec<&Message> = orch
        .transcript()
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|m| m.content == "Error: Cancelled by user"));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(orch.state(), OrchestratorState::Cancelled);
}

fn long_history(count: usize) -> ConversationHistory {
    let messages = (0..count)
        .map(|i| {
            let body = format!("turn {} {}", i, "lorem ipsum dolor sit amet ".repeat(20));
            if i % 2 == 0 {
                Message::user(body)
            } else {
                Message::assistant(body)
            }
        })
        .collect();
    ConversationHistory::new(messages, "scripted-1")
}

/// A follow-up that arrives during summarization waits for it and is sent once
#[tokio::test]
async fn test_summarization_gates_follow_up() {
    let store = Arc::new(MemoryHistoryStore::new());
    store.save(&long_history(30)).await.unwrap();

    let client = ScriptedClient::with_summaries(
        vec![
            Script::Reply(calls(&[("c1", "add", json!({"a": 1, "b": 2}))])),
            Script::Reply(text("done")),
        ],
        vec!["## Goal\nTesting summaries"],
    );
    let context = ContextConfig {
        context_length: 8_000,
        reserved_response_tokens: 500,
        summarize_threshold: 0.25,
        recent_keep: 4,
        ..ContextConfig::default()
    };
    let mut orch = build_with(
        &client,
        add_registry(),
        orchestrator_config(25),
        context,
        Arc::new(McpManager::default()),
    )
    .with_history_store(store.clone());
    assert!(orch.load_history().await.unwrap());
    let mut events = orch.subscribe();

    orch.send_message("add please", None).await.unwrap();
    orch.run_until_settled().await;

    let events = drain(&mut events);
    let completed = events.iter().find_map(|e| match e {
        OrchestratorEvent::SummarizationCompleted { messages } => Some(*messages),
        _ => None,
    });
    assert_eq!(completed, Some(5));
    assert_eq!(client.summary_count(), 1);
    assert!(client.summary_requests.lock().unwrap()[0].tools.is_empty());

    // The follow-up went out after the summary, exactly once
    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.content.contains("Testing summaries")));

    assert_eq!(orch.summary().unwrap().text, "## Goal\nTesting summaries");
    assert!(orch.transcript()[0].summary);
    assert_eq!(orch.transcript().last().unwrap().content, "done");

    let saved = store.load().await.unwrap().unwrap();
    assert!(saved.summary.is_some());
    assert_eq!(saved.messages.len(), orch.transcript().len());
}

#[tokio::test]
async fn test_reset_session() {
    let store = Arc::new(MemoryHistoryStore::new());
    let client = ScriptedClient::new(vec![Script::Reply(text("one"))]);
    let mut orch =
        build(&client, ToolRegistry::new(), orchestrator_config(25)).with_history_store(store.clone());

    orch.send_message("hi", None).await.unwrap();
    orch.run_until_settled().await;
    assert_eq!(orch.usage().requests, 1);

    orch.reset_session().await;
    assert!(orch.transcript().is_empty());
    assert!(orch.summary().is_none());
    assert_eq!(orch.usage().requests, 0);
    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(store.load().await.unwrap().unwrap().messages.is_empty());
}

/// Tools served by a remote MCP server are offered to the model and routed there
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_tool_through_mcp() {
    let remote = ToolRegistry::new();
    remote
        .register(Arc::new(FnTool::sync(
            "remote_upper",
            "Uppercase a string",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args| Ok(json!(args["text"].as_str().unwrap_or("").to_uppercase())),
        )))
        .unwrap();
    let (executor, jobs) = MainThreadExecutor::new();
    let host_config = HostConfig {
        port: 0,
        api_key: None,
        ..HostConfig::default()
    };
    let host = ProtocolHost::start(host_config, remote.clone(), Arc::new(executor)).unwrap();
    tokio::spawn(serve_jobs(remote, jobs));

    let mcp = Arc::new(McpManager::new(vec![McpServerConfig::http("remote", &host.url())]));
    assert!(mcp.connect_all().await.is_empty());

    let client = ScriptedClient::new(vec![
        Script::Reply(calls(&[("c1", "remote_upper", json!({"text": "quiet"}))])),
        Script::Reply(text("QUIET it is")),
    ]);
    let mut orch = build_with(
        &client,
        ToolRegistry::new(),
        orchestrator_config(25),
        context_config(),
        mcp.clone(),
    );

    orch.send_message("shout quiet", None).await.unwrap();
    orch.run_until_settled().await;

    let requests = client.requests();
    assert!(requests[0].tools.iter().any(|t| t.name == "remote_upper"));
    let tool = &orch.transcript()[2];
    assert_eq!(tool.role, MessageRole::Tool);
    assert_eq!(tool.content, "QUIET");
    assert_eq!(orch.transcript().last().unwrap().content, "QUIET it is");
    mcp.shutdown().await;
}

/// The spawned loop is driven entirely through its handle
#[tokio::test]
async fn test_handle_drives_conversation() {
    let client = ScriptedClient::new(vec![Script::Reply(text("from the loop"))]);
    let orch = build(&client, ToolRegistry::new(), orchestrator_config(25));
    let handle = orch.spawn();
    let mut events = handle.subscribe();

    handle.send_message("hi", None).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::MessageUpdated { message, .. }) if !message.streaming => {
                    return message.content;
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply, "from the loop");

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.transcript.len(), 2);
    assert_eq!(
        handle.continue_after_limit().await,
        Err(ConversationError::InvalidState(snapshot.state))
    );
    handle.shutdown().await;
}
