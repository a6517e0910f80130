//! Ollama chat adapter.
//!
//! Wire format: one bare JSON object per line, no framing prefix. The last
//! record carries `"done": true`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::message::{Message, Role};
use crate::config::ProviderConfig;
use crate::tools::ToolDefinition;
use crate::Result;

use super::framing::{check_status, decode_frames, ndjson_frames, send_error, Frame};
use super::{ChatRequest, EventStream, ProviderAdapter, ProviderProfile, StreamEvent, Vendor};

/// Adapter for a local or remote Ollama server.
#[derive(Clone)]
pub struct OllamaAdapter {
    endpoint: String,
    model: String,
    temperature: f32,
    num_predict: u32,
    debug_wire: bool,
    profile: ProviderProfile,
    client: Client,
}

impl OllamaAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            endpoint: config.endpoint_url(),
            model: config.model_name().to_string(),
            temperature: config.temperature,
            num_predict: config.max_output_tokens,
            debug_wire: config.debug_wire,
            profile: ProviderProfile::for_config(config),
            client: Client::new(),
        }
    }

    fn build_url(&self) -> String {
        format!("{}/api/chat", self.endpoint)
    }

    /// Request body for one streaming round.
    pub fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.extend(
            request
                .wire_messages(&self.profile)
                .iter()
                .map(convert_message),
        );

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.num_predict,
            }
        });
        if let Some(tools) = request.native_tools(&self.profile) {
            body["tools"] = convert_tools(tools);
        }
        body
    }
}

fn convert_message(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut value = json!({"role": role, "content": msg.content});
    if !msg.calls().is_empty() {
        value["tool_calls"] = msg
            .calls()
            .iter()
            .map(|call| json!({"function": {"name": call.name, "arguments": call.args}}))
            .collect();
    }
    value
}

fn convert_tools(tools: &[ToolDefinition]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters
                }
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<LineToolCall>,
}

#[derive(Debug, Deserialize)]
struct LineToolCall {
    function: LineFunction,
}

#[derive(Debug, Deserialize)]
struct LineFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn decode_line(line: String, debug_wire: bool) -> Frame {
    if debug_wire {
        debug!("ollama frame: {}", line);
    }
    let record: ChatLine = match serde_json::from_str(&line) {
        Ok(record) => record,
        Err(e) => {
            warn!("Skipping malformed Ollama line: {}", e);
            return Frame::Skip;
        }
    };
    if let Some(error) = record.error {
        return Frame::Fail(error);
    }

    let mut events = Vec::new();
    if let Some(message) = record.message {
        if !message.content.is_empty() {
            events.push(StreamEvent::TextDelta(message.content));
        }
        // Ollama sends each native tool call whole, arguments already an object.
        for call in message.tool_calls {
            events.push(StreamEvent::ToolCallComplete {
                id: None,
                name: call.function.name,
                arguments: call.function.arguments,
            });
        }
    }

    if record.done {
        events.push(StreamEvent::Finish {
            reason: record.done_reason,
        });
        Frame::End(events)
    } else {
        Frame::Events(events)
    }
}

/// Decode an Ollama NDJSON byte stream into normalized events.
pub fn decode_stream<S, E>(bytes: S, debug_wire: bool) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    decode_frames(Vendor::Ollama, ndjson_frames(bytes), move |line| {
        decode_line(line, debug_wire)
    })
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Ollama
    }

    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn open(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request);
        debug!("Ollama request to {} (model {})", self.build_url(), self.model);

        let response = self
            .client
            .post(self.build_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(Vendor::Ollama, e))?;
        let response = check_status(Vendor::Ollama, response).await?;

        Ok(decode_stream(response.bytes_stream(), self.debug_wire))
    }
}

#[cfg(test)]
mod tests {
    use super::super::framing::test_support::{chunked, collect, text_of};
    use super::*;
    use crate::agent::llm::ToolMode;
    use crate::error::Error;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lines(records: &[&str]) -> Vec<String> {
        records.iter().map(|r| format!("{}\n", r)).collect()
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let wire = lines(&[
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"#,
            r#"{"message":{"role":"assistant","content":" there"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop"}"#,
        ]);
        let (events, err) = collect(decode_stream(chunked(wire), false)).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), "Hello there");
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Finish { reason: Some("stop".to_string()) })
        );
    }

    #[tokio::test]
    async fn test_native_tool_calls_arrive_whole() {
        let wire = lines(&[
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"read_file","arguments":{"path":"notes.md"}}}]},"done":false}"#,
            r#"{"done":true,"done_reason":"stop"}"#,
        ]);
        let (events, _) = collect(decode_stream(chunked(wire), false)).await;
        assert_eq!(
            events[0],
            StreamEvent::ToolCallComplete {
                id: None,
                name: "read_file".to_string(),
                arguments: json!({"path": "notes.md"}),
            }
        );
    }

    #[tokio::test]
    async fn test_records_after_done_are_ignored() {
        let wire = lines(&[
            r#"{"message":{"content":"a"},"done":true}"#,
            r#"{"message":{"content":"b"},"done":false}"#,
        ]);
        let (events, _) = collect(decode_stream(chunked(wire), false)).await;
        assert_eq!(text_of(&events), "a");
    }

    #[tokio::test]
    async fn test_error_record_fails_stream() {
        let wire = lines(&[r#"{"error":"model 'nope' not found"}"#]);
        let (_, err) = collect(decode_stream(chunked(wire), false)).await;
        assert_eq!(err.map(|e| e.message()), Some("model 'nope' not found".to_string()));
    }

    #[test]
    fn test_in_text_mode_sends_no_tools() {
        let adapter = OllamaAdapter::new(&ProviderConfig {
            vendor: Vendor::Ollama,
            ..ProviderConfig::default()
        });
        assert_eq!(adapter.profile().tool_mode, ToolMode::InText);
        let request = ChatRequest {
            prompt: "hi".to_string(),
            system: "sys".to_string(),
            tools: Some(vec![ToolDefinition {
                name: "read_file".to_string(),
                description: "Read".to_string(),
                parameters: json!({"type": "object"}),
            }]),
            ..ChatRequest::default()
        };
        let body = adapter.build_body(&request);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["options"]["num_predict"], 4096);
    }

    #[tokio::test]
    async fn test_open_streams_from_server() {
        let server = MockServer::start().await;
        let wire = lines(&[
            r#"{"message":{"content":"Local"},"done":false}"#,
            r#"{"message":{"content":" model"},"done":true,"done_reason":"stop"}"#,
        ])
        .concat();
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(wire, "application/x-ndjson"))
            .mount(&server)
            .await;

        let adapter = OllamaAdapter::new(&ProviderConfig {
            vendor: Vendor::Ollama,
            endpoint: Some(server.uri()),
            ..ProviderConfig::default()
        });
        let (events, err) = collect(adapter.open(&ChatRequest::default()).await.unwrap()).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), "Local model");
    }

    #[tokio::test]
    async fn test_not_found_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("{\"error\":\"model not found\"}"))
            .mount(&server)
            .await;
        let adapter = OllamaAdapter::new(&ProviderConfig {
            vendor: Vendor::Ollama,
            endpoint: Some(server.uri()),
            ..ProviderConfig::default()
        });
        let err = adapter.open(&ChatRequest::default()).await.err().unwrap();
        assert!(matches!(err, Error::Transport { vendor: Vendor::Ollama, .. }));
        assert!(err.message().contains("HTTP 404"));
    }
}
