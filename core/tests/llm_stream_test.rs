// Provider streaming against a local SSE server

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use weft_core::llm::{ChatRequest, FinishReason, OpenAiClient, StreamEvent};
use weft_core::{LlmClient, LlmClientConfig, LlmError, Message};

/// Read one HTTP request, headers plus `Content-Length` body
async fn read_request(stream: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }
}

/// Serve one request: wait, then write each `(delay, bytes)` step in order
async fn serve_once(steps: Vec<(u64, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        for (delay, bytes) in steps {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if stream.write_all(bytes.as_bytes()).await.is_err() {
                return;
            }
            let _ = stream.flush().await;
        }
    });
    format!("http://{}", addr)
}

const SSE_HEADERS: &str =
    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";

fn delta(text: &str) -> String {
    format!(
        "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
        text
    )
}

fn client(base_url: String, request_ms: u64, idle_ms: u64) -> OpenAiClient {
    let mut cfg = LlmClientConfig::default();
    cfg.base_url = base_url;
    cfg.api_key = Some("test-key".into());
    cfg.request_timeout_ms = request_ms;
    cfg.stream_idle_timeout_ms = idle_ms;
    OpenAiClient::new(cfg).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "gpt-test".into(),
        messages: vec![Message::user("hi")],
        tools: Vec::new(),
        max_tokens: None,
        temperature: None,
    }
}

/// Collect events until the stream reports done or an error
async fn collect(mut rx: UnboundedReceiver<StreamEvent>) -> (String, Option<StreamEvent>) {
    let mut text = String::new();
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta(t) => text.push_str(&t),
                StreamEvent::Done(_) | StreamEvent::Error(_) => return Some(event),
                _ => {}
            }
        }
        None
    })
    .await
    .unwrap();
    (text, outcome)
}

/// A reply that keeps streaming is not cut by the total request deadline
#[tokio::test]
async fn test_long_stream_outlives_request_timeout() {
    let mut steps = vec![(0, SSE_HEADERS.to_string())];
    for word in ["one ", "two ", "three ", "four"] {
        steps.push((120, delta(word)));
    }
    steps.push((
        0,
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n".to_string(),
    ));
    steps.push((0, "data: [DONE]\n\n".to_string()));
    let url = serve_once(steps).await;

    let llm = client(url, 200, 2_000);
    let (text, outcome) = collect(llm.send_chat_request(request()).unwrap()).await;
    assert_eq!(text, "one two three four");
    assert!(matches!(outcome, Some(StreamEvent::Done(FinishReason::Stop))));
}

/// A provider that goes quiet mid-reply fails after the idle timeout
#[tokio::test]
async fn test_silent_stream_fails_after_idle_timeout() {
    let url = serve_once(vec![
        (0, SSE_HEADERS.to_string()),
        (0, delta("partial")),
        (3_000, delta("late")),
    ])
    .await;

    let llm = client(url, 60_000, 200);
    let (text, outcome) = collect(llm.send_chat_request(request()).unwrap()).await;
    assert_eq!(text, "partial");
    assert!(matches!(outcome, Some(StreamEvent::Error(LlmError::Stream(_)))));
}

/// Non-streaming requests keep a total deadline
#[tokio::test]
async fn test_complete_has_total_deadline() {
    let body = r#"{"choices":[{"message":{"content":"late"},"finish_reason":"stop"}]}"#;
    let url = serve_once(vec![(
        1_000,
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    )])
    .await;

    let llm = client(url, 200, 60_000);
    assert!(matches!(llm.complete(request()).await, Err(LlmError::Http(_))));
}
