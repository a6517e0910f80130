//! Anthropic Messages API adapter.
//!
//! Wire format: typed SSE events. Text arrives as `text_delta`, tool input as
//! `input_json_delta` fragments of a `tool_use` block that is closed by
//! `content_block_stop`.

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

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for Anthropic's streaming Messages API.
#[derive(Clone)]
pub struct AnthropicAdapter {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    debug_wire: bool,
    profile: ProviderProfile,
    client: Client,
}

impl AnthropicAdapter {
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
        format!("{}/messages", self.endpoint)
    }

    /// Request body for one streaming round.
    pub fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        let mut system = request.system.clone();

        for msg in request.wire_messages(&self.profile) {
            let (role, blocks) = match msg.role {
                // No system role in the messages array; fold into `system`.
                Role::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&msg.content);
                    continue;
                }
                Role::Tool => ("user", vec![json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                    "content": msg.content,
                })]),
                Role::User => ("user", text_blocks(&msg.content)),
                Role::Assistant => {
                    let mut blocks = text_blocks(&msg.content);
                    blocks.extend(msg.calls().iter().map(|call| {
                        json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.args,
                        })
                    }));
                    ("assistant", blocks)
                }
            };
            if blocks.is_empty() {
                continue;
            }
            push_merged(&mut messages, role, blocks);
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if let Some(tools) = request.native_tools(&self.profile) {
            body["tools"] = convert_tools(tools);
        }
        body
    }
}

fn text_blocks(text: &str) -> Vec<Value> {
    if text.is_empty() {
        vec![]
    } else {
        vec![json!({"type": "text", "text": text})]
    }
}

/// Roles must alternate; consecutive turns of one role share a message.
fn push_merged(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if let Some(last) = messages.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": blocks}));
}

fn convert_tools(tools: &[ToolDefinition]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: ContentBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    error: StreamErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StreamErrorDetails {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

fn parse<T: for<'de> Deserialize<'de>>(kind: &str, data: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping malformed Anthropic {} event: {}", kind, e);
            None
        }
    }
}

/// Event type from the `event:` line, falling back to the payload's `type`
/// for proxies that drop the SSE event name.
fn event_kind(event: &Event) -> String {
    if !event.event.is_empty() && event.event != "message" {
        return event.event.clone();
    }
    serde_json::from_str::<Value>(&event.data)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_default()
}

fn decode_event(event: Event, debug_wire: bool) -> Frame {
    let kind = event_kind(&event);
    let data = event.data.as_str();
    if debug_wire {
        debug!("anthropic frame [{}]: {}", kind, data);
    }

    match kind.as_str() {
        "content_block_start" => {
            let Some(start) = parse::<ContentBlockStart>(&kind, data) else {
                return Frame::Skip;
            };
            match start.content_block {
                ContentBlock::ToolUse { id, name } => Frame::Events(vec![StreamEvent::ToolCallDelta {
                    index: start.index,
                    id: Some(id),
                    name: Some(name),
                    arguments: None,
                }]),
                ContentBlock::Text { text } if !text.is_empty() => {
                    Frame::Events(vec![StreamEvent::TextDelta(text)])
                }
                _ => Frame::Skip,
            }
        }
        "content_block_delta" => {
            let Some(delta) = parse::<ContentBlockDelta>(&kind, data) else {
                return Frame::Skip;
            };
            match delta.delta {
                Delta::TextDelta { text } => Frame::Events(vec![StreamEvent::TextDelta(text)]),
                Delta::InputJsonDelta { partial_json } => {
                    Frame::Events(vec![StreamEvent::ToolCallDelta {
                        index: delta.index,
                        id: None,
                        name: None,
                        arguments: Some(partial_json),
                    }])
                }
                Delta::Unknown => Frame::Skip,
            }
        }
        "content_block_stop" => match parse::<ContentBlockStop>(&kind, data) {
            Some(stop) => Frame::Events(vec![StreamEvent::ToolCallEnd { index: stop.index }]),
            None => Frame::Skip,
        },
        "message_delta" => match parse::<MessageDelta>(&kind, data) {
            Some(delta) => Frame::Events(vec![StreamEvent::Finish {
                reason: delta.delta.stop_reason,
            }]),
            None => Frame::Skip,
        },
        "message_stop" => Frame::End(vec![]),
        "error" => match serde_json::from_str::<StreamError>(data) {
            Ok(err) => Frame::Fail(format!("{}: {}", err.error.error_type, err.error.message)),
            Err(_) => Frame::Fail(data.to_string()),
        },
        // message_start, ping, and anything newer
        _ => Frame::Skip,
    }
}

/// Decode an Anthropic SSE byte stream into normalized events.
pub fn decode_stream<S, E>(bytes: S, debug_wire: bool) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    decode_frames(Vendor::Anthropic, sse_frames(bytes), move |event| {
        decode_event(event, debug_wire)
    })
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Anthropic
    }

    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn open(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request);
        debug!("Anthropic request to {}", self.build_url());

        let response = self
            .client
            .post(self.build_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(Vendor::Anthropic, e))?;
        let response = check_status(Vendor::Anthropic, response).await?;

        Ok(decode_stream(response.bytes_stream(), self.debug_wire))
    }
}
