//! OpenAI-compatible chat completions adapter.
//!
//! Wire format: `data: <json>\n\n` records terminated by `data: [DONE]`.
//! Tool-call arguments arrive as string fragments keyed by `index`.

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Event;
use futures_util::Stream;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::message::{Message, Role};
use crate::config::ProviderConfig;
use crate::tools::ToolDefinition;
use crate::Result;

use super::framing::{check_status, decode_frames, send_error, sse_frames, Frame};
use super::{ChatRequest, EventStream, ProviderAdapter, ProviderProfile, StreamEvent, Vendor};

const DONE_MARKER: &str = "[DONE]";

/// Adapter for OpenAI and OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiAdapter {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    debug_wire: bool,
    profile: ProviderProfile,
    client: Client,
}

impl OpenAiAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            endpoint: config.endpoint_url(),
            api_key: config.api_key.clone(),
            model: config.model_name().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            debug_wire: config.debug_wire,
            profile: ProviderProfile::for_config(config),
            client: Client::new(),
        }
    }

    fn build_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    /// Request body for one streaming round.
    pub fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.extend(request.wire_messages(&self.profile).iter().map(convert_message));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(tools) = request.native_tools(&self.profile) {
            body["tools"] = convert_tools(tools);
        }
        body
    }
}

fn convert_message(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant if !msg.calls().is_empty() => {
            let calls: Vec<Value> = msg
                .calls()
                .iter()
                // The executed arguments, after recovery and the `{}` fallback.
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.args.to_string()}
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                Value::Null
            } else {
                Value::String(msg.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::System => json!({"role": "system", "content": msg.content}),
        Role::User => json!({"role": "user", "content": msg.content}),
        Role::Assistant => json!({"role": "assistant", "content": msg.content}),
    }
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
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallChunk>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

fn extract_api_error(event: &Value) -> Option<String> {
    let error = event.get("error")?;
    if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("An error occurred during streaming".to_string())
}

fn decode_event(event: Event, debug_wire: bool) -> Frame {
    let raw = event.data;
    if debug_wire {
        debug!("openai frame: {}", raw);
    }
    if raw.trim() == DONE_MARKER {
        return Frame::End(vec![]);
    }

    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Skipping malformed OpenAI frame: {}", e);
            return Frame::Skip;
        }
    };
    if let Some(message) = extract_api_error(&value) {
        return Frame::Fail(message);
    }
    let chunk: Chunk = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Skipping OpenAI frame with unexpected shape: {}", e);
            return Frame::Skip;
        }
    };

    // Only the first choice is ever requested.
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Frame::Skip;
    };

    let mut events = Vec::new();
    if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
        events.push(StreamEvent::TextDelta(text));
    }
    for call in choice.delta.tool_calls {
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        events.push(StreamEvent::ToolCallDelta {
            index: call.index,
            id: call.id,
            name,
            arguments,
        });
    }
    if let Some(reason) = choice.finish_reason {
        events.push(StreamEvent::Finish {
            reason: Some(reason),
        });
    }
    Frame::Events(events)
}

/// Decode an OpenAI SSE byte stream into normalized events.
pub fn decode_stream<S, E>(bytes: S, debug_wire: bool) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    decode_frames(Vendor::OpenAi, sse_frames(bytes), move |event| {
        decode_event(event, debug_wire)
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn open(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request);
        debug!("OpenAI request to {} ({} messages)", self.build_url(), body["messages"].as_array().map_or(0, |m| m.len()));

        let response = self
            .client
            .post(self.build_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(Vendor::OpenAi, e))?;
        let response = check_status(Vendor::OpenAi, response).await?;

        Ok(decode_stream(response.bytes_stream(), self.debug_wire))
    }
}
