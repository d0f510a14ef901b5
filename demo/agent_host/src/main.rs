mod config;

use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use weft_core::tools::ParamType;
use weft_core::{
    create_client, telemetry, FnTool, MessageRole, OrchestratorEvent, OrchestratorHandle,
    SchemaBuilder, ToolError, ToolRegistry, Weft,
};

const HELP: &str = "Commands: /cancel /continue /approve /reject /reset /status /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing("warn,weft_core=info,agent_host=info");

    info!(target: "agent_host", "Starting agent host demo");

    // Defaults + env + optional TOML overlay
    let cfg = config::load();
    let client = create_client(&cfg.llm)?;

    let mut weft = Weft::new(cfg);
    register_demo_tools(weft.registry())?;

    let orchestrator = weft.start(client).await?;
    if let Some(host) = weft.host() {
        println!("Serving {} tools at {}", weft.registry().len(), host.url());
    }
    for server in weft.mcp().list_servers().await {
        println!(
            "Remote server '{}' ({}): {} tools{}",
            server.name,
            server.transport,
            server.tool_count,
            if server.connected { "" } else { " [offline]" }
        );
    }

    let handle = orchestrator.spawn();
    let printer = tokio::spawn(print_events(handle.subscribe()));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: "agent_host", "Interrupted");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(target: "agent_host", error = %e, "Failed to read stdin");
                        break;
                    }
                };
                if !handle_line(line.trim(), &handle).await {
                    break;
                }
            }
        }
    }

    handle.shutdown().await;
    printer.abort();
    weft.shutdown().await;
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_line(line: &str, handle: &OrchestratorHandle) -> bool {
    let result = match line {
        "" => Ok(()),
        "/quit" | "/exit" => return false,
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        "/cancel" => handle.cancel_request(),
        "/continue" => handle.continue_after_limit().await,
        "/approve" => handle.approve().await,
        "/reject" => handle.reject().await,
        "/reset" => handle.reset_session(),
        "/status" => match handle.snapshot().await {
            Ok(snapshot) => {
                println!(
                    "state={} messages={} tokens={}/{} requests={}",
                    snapshot.state,
                    snapshot.transcript.len(),
                    snapshot.token_budget.used,
                    snapshot.token_budget.limit,
                    snapshot.usage.requests
                );
                Ok(())
            }
            Err(e) => Err(e),
        },
        text => handle.send_message(text, None).await,
    };
    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<OrchestratorEvent>) {
    // Characters already printed per streaming message
    let mut printed: HashMap<usize, usize> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!(target: "agent_host", skipped = n, "Event printer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            OrchestratorEvent::MessageUpdated { index, message }
                if message.role == MessageRole::Assistant =>
            {
                let done = printed.entry(index).or_insert(0);
                if let Some(fresh) = message.content.get(*done..) {
                    print!("{}", fresh);
                    let _ = std::io::stdout().flush();
                    *done = message.content.len();
                }
                if !message.streaming {
                    println!();
                    printed.remove(&index);
                }
            }
            OrchestratorEvent::MessageAdded { message, .. } if message.role == MessageRole::Tool => {
                println!("  [tool] {}", preview(&message.content, 160));
            }
            OrchestratorEvent::ToolCallApprovalRequired { call } => {
                println!(
                    "? '{}' wants to run with {}. /approve or /reject",
                    call.name, call.arguments
                );
            }
            OrchestratorEvent::IterationLimitReached { iterations, ceiling } => {
                println!("? Stopped after {} of {} automatic steps. /continue to keep going", iterations, ceiling);
            }
            OrchestratorEvent::SummarizationStarted => println!("  (summarizing earlier conversation)"),
            OrchestratorEvent::Error { message } => println!("! {}", message),
            _ => {}
        }
    }
}

fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn register_demo_tools(registry: &ToolRegistry) -> Result<(), ToolError> {
    let clock = SchemaBuilder::new("current_time", "Current time as a Unix timestamp")
        .optional("offset_secs", ParamType::Integer, "Seconds to add to now");
    registry.register(Arc::new(FnTool::sync(
        "current_time",
        "Current time as a Unix timestamp",
        clock.input_schema(),
        |args| {
            let offset = args.get("offset_secs").and_then(|v| v.as_i64()).unwrap_or(0);
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| ToolError::Internal(e.to_string()))?
                .as_secs() as i64;
            Ok(json!({ "unix": now + offset }))
        },
    )))?;

    let counter = SchemaBuilder::new("word_count", "Count words and lines in a text")
        .required("text", ParamType::String, "Text to analyse");
    registry.register(Arc::new(FnTool::sync(
        "word_count",
        "Count words and lines in a text",
        counter.input_schema(),
        |args| {
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidArguments("text is required".into()))?;
            Ok(json!({
                "words": text.split_whitespace().count(),
                "lines": text.lines().count(),
            }))
        },
    )))?;
    Ok(())
}
