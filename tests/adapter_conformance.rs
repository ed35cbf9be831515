//! Every adapter turns its wire format into the same normalized events.

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use aicli::config::{ChatGptConfig, ClaudeConfig, OllamaConfig};
use aicli::error::ErrorCategory;
use aicli::provider::anthropic::AnthropicAdapter;
use aicli::provider::ollama::OllamaAdapter;
use aicli::provider::openai::OpenAiAdapter;
use aicli::provider::ProviderAdapter;
use aicli::tools::{BuiltinSettings, ToolRegistry};
use aicli::types::{Conversation, Message, NormalizedEvent};

#[derive(Debug, PartialEq)]
enum Shape {
    Text(String),
    Call(String, Value),
    Complete,
}

/// Collapse text deltas so chunking differences between backends disappear.
async fn shape_of(adapter: &dyn ProviderAdapter) -> Vec<Shape> {
    let mut conversation = Conversation::new();
    conversation.push(Message::user("What files are in the current directory?"));
    let dir = tempfile::tempdir().unwrap();
    let tools = ToolRegistry::with_builtins(dir.path(), &BuiltinSettings::default()).schemas();

    let mut stream = adapter.start_turn(&conversation, &tools).await.unwrap();
    let mut shape = Vec::new();
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            NormalizedEvent::TextDelta { text } => match shape.last_mut() {
                Some(Shape::Text(acc)) => acc.push_str(&text),
                _ => shape.push(Shape::Text(text)),
            },
            NormalizedEvent::ToolCallRequested { call } => {
                assert!(!call.id.is_empty());
                shape.push(Shape::Call(call.name.clone(), call.arguments_value()));
            }
            NormalizedEvent::TurnComplete => shape.push(Shape::Complete),
        }
    }
    for part in &mut shape {
        if let Shape::Text(text) = part {
            *text = text.trim().to_string();
        }
    }
    shape
}

fn expected() -> Vec<Shape> {
    vec![
        Shape::Text("Listing.".into()),
        Shape::Call("list_files".into(), json!({"directory": "."})),
        Shape::Complete,
    ]
}

fn sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("data: {e}\n\n"))
        .collect::<String>()
}

#[tokio::test]
async fn anthropic_stream_normalizes() {
    let server = MockServer::start().await;
    let body = sse(&[
        json!({"type": "message_start", "message": {"id": "msg_1", "role": "assistant", "content": []}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "List"}}),
        json!({"type": "ping"}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "ing."}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_01", "name": "list_files", "input": {}}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"directory\":"}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": " \".\"}"}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        json!({"type": "message_stop"}),
    ]);
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let adapter = AnthropicAdapter::new(
        ClaudeConfig {
            base_url: Some(server.uri()),
            ..ClaudeConfig::default()
        },
        "sk-ant-test".into(),
    );
    assert_eq!(shape_of(&adapter).await, expected());
}

#[tokio::test]
async fn openai_stream_normalizes() {
    let server = MockServer::start().await;
    let mut body = sse(&[
        json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Listing."}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function", "function": {"name": "list_files", "arguments": ""}}]}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"directory\":"}}]}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": " \".\"}"}}]}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
    ]);
    body.push_str("data: [DONE]\n\n");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let adapter = OpenAiAdapter::new(
        ChatGptConfig {
            base_url: Some(server.uri()),
            ..ChatGptConfig::default()
        },
        "sk-test".into(),
    );
    assert_eq!(shape_of(&adapter).await, expected());
}

#[tokio::test]
async fn ollama_stream_normalizes() {
    let server = MockServer::start().await;
    let directive = r#"{"tool_call": {"name": "list_files", "arguments": {"directory": "."}}}"#;
    let lines = [
        json!({"model": "llama3.2", "response": "Listing.", "done": false}),
        json!({"model": "llama3.2", "response": &directive[..20], "done": false}),
        json!({"model": "llama3.2", "response": &directive[20..], "done": false}),
        json!({"model": "llama3.2", "response": "", "done": true}),
    ];
    let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/x-ndjson")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let adapter = OllamaAdapter::new(OllamaConfig {
        base_url: server.uri(),
        ..OllamaConfig::default()
    });
    assert_eq!(shape_of(&adapter).await, expected());
}

#[tokio::test]
async fn unauthorized_response_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "invalid x-api-key"},
        })))
        .mount(&server)
        .await;

    let adapter = AnthropicAdapter::new(
        ClaudeConfig {
            base_url: Some(server.uri()),
            ..ClaudeConfig::default()
        },
        "sk-ant-wrong".into(),
    );
    let mut conversation = Conversation::new();
    conversation.push(Message::user("hi"));
    let err = match adapter.start_turn(&conversation, &[]).await {
        Ok(_) => panic!("expected an error"),
        Err(err) => err,
    };
    assert_eq!(err.category(), ErrorCategory::Authentication);
    assert!(err.is_fatal_for_provider());
}

#[tokio::test]
async fn validate_hits_the_model_listing_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&server)
        .await;

    let ollama = OllamaAdapter::new(OllamaConfig {
        base_url: server.uri(),
        ..OllamaConfig::default()
    });
    ollama.validate().await.unwrap();

    let openai = OpenAiAdapter::new(
        ChatGptConfig {
            base_url: Some(server.uri()),
            ..ChatGptConfig::default()
        },
        "sk-test".into(),
    );
    let err = openai.validate().await.unwrap_err();
    assert!(err.is_retryable());
}

/// Serve one chunked NDJSON response, pausing `gap` before each line.
async fn trickling_ollama(lines: Vec<Value>, gap: std::time::Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Drain the request so closing the socket does not reset the client.
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }

        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        for line in lines {
            tokio::time::sleep(gap).await;
            let data = format!("{line}\n");
            let chunk = format!("{:x}\r\n{data}\r\n", data.len());
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = socket.write_all(b"0\r\n\r\n").await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn ollama_stream_outlasting_the_timeout_completes_while_chunks_keep_coming() {
    let lines = vec![
        json!({"model": "llama3.2", "response": "Still ", "done": false}),
        json!({"model": "llama3.2", "response": "thinking, ", "done": false}),
        json!({"model": "llama3.2", "response": "almost ", "done": false}),
        json!({"model": "llama3.2", "response": "there.", "done": false}),
        json!({"model": "llama3.2", "response": "", "done": true}),
    ];
    let base_url = trickling_ollama(lines, std::time::Duration::from_millis(400)).await;
    let adapter = OllamaAdapter::new(OllamaConfig {
        base_url,
        timeout_secs: 1,
        ..OllamaConfig::default()
    });

    let mut conversation = Conversation::new();
    conversation.push(Message::user("take your time"));
    let mut stream = adapter.start_turn(&conversation, &[]).await.unwrap();
    let mut text = String::new();
    let mut completed = false;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            NormalizedEvent::TextDelta { text: delta } => text.push_str(&delta),
            NormalizedEvent::TurnComplete => completed = true,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(completed);
    assert_eq!(text.trim(), "Still thinking, almost there.");
}

#[tokio::test]
async fn ollama_stream_that_goes_quiet_times_out() {
    let lines = vec![
        json!({"model": "llama3.2", "response": "Hello", "done": false}),
        json!({"model": "llama3.2", "response": "", "done": true}),
    ];
    let base_url = trickling_ollama(lines, std::time::Duration::from_millis(1500)).await;
    let adapter = OllamaAdapter::new(OllamaConfig {
        base_url,
        timeout_secs: 1,
        ..OllamaConfig::default()
    });

    let mut conversation = Conversation::new();
    conversation.push(Message::user("hi"));
    let mut stream = adapter.start_turn(&conversation, &[]).await.unwrap();
    let err = loop {
        match stream.next().await {
            Some(Ok(_)) => continue,
            Some(Err(err)) => break err,
            None => panic!("stream ended without an error"),
        }
    };
    assert!(matches!(err, aicli::error::AicliError::Timeout(1000)), "got: {err:?}");
    assert!(err.is_retryable());
}
