//! Provider stream adapters.
//!
//! This module provides:
//! - [`ProviderAdapter`] trait: one implementation per vendor wire format
//! - [`StreamEvent`]: the normalized event model every adapter emits
//! - [`ProviderRegistry`] for selecting the adapter once per exchange
//! - Concrete implementations: OpenAI-compatible SSE, Anthropic typed SSE,
//!   Ollama NDJSON, Gemini single-document
//!
//! # Adding a New Provider
//!
//! 1. Create a new file (e.g., `mistral.rs`)
//! 2. Implement `ProviderAdapter` trait
//! 3. Add a [`Vendor`] variant and wire it in `ProviderRegistry::create()`

mod framing;
mod types;

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::text_protocol;
use crate::config::ProviderConfig;
use crate::error::Error;
use crate::tools::ToolDefinition;
use crate::Result;

use super::message::{Message, Role};

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// Supported chat-completion vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    /// OpenAI and OpenAI-compatible endpoints
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
    Gemini,
}

impl Vendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Ollama => "ollama",
            Vendor::Gemini => "gemini",
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Vendor::OpenAi => "https://api.openai.com/v1",
            Vendor::Anthropic => "https://api.anthropic.com/v1",
            Vendor::Ollama => "http://localhost:11434",
            Vendor::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Vendor::OpenAi => "gpt-4o-mini",
            Vendor::Anthropic => "claude-3-5-sonnet-latest",
            Vendor::Ollama => "llama3.1",
            Vendor::Gemini => "gemini-2.0-flash",
        }
    }

    /// Whether the vendor rejects requests without an API key.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Vendor::Ollama)
    }

    fn default_tool_mode(self) -> ToolMode {
        match self {
            Vendor::Ollama => ToolMode::InText,
            _ => ToolMode::Native,
        }
    }

    fn default_context_chars(self) -> usize {
        match self {
            Vendor::OpenAi => 100_000,
            Vendor::Anthropic => 150_000,
            Vendor::Ollama => 12_000,
            Vendor::Gemini => 200_000,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How tool calls travel between the model and the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// Vendor-native tool-call fields in the stream
    Native,
    /// `<tool_call>` blocks in the text plus a completion sentinel
    InText,
}

/// Declarative per-adapter protocol settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    pub tool_mode: ToolMode,
    /// Character budget for raw source documents in the system prompt
    pub context_chars: usize,
    /// User message appended after tool results, for vendors that otherwise
    /// stop instead of continuing
    pub continuation_prompt: Option<String>,
}

impl ProviderProfile {
    /// Vendor defaults with the config's overrides applied.
    pub fn for_config(config: &ProviderConfig) -> Self {
        let tool_mode = config
            .tool_mode
            .unwrap_or_else(|| config.vendor.default_tool_mode());
        let continuation_prompt = match &config.continuation_prompt {
            Some(prompt) if prompt.is_empty() => None,
            Some(prompt) => Some(prompt.clone()),
            None if tool_mode == ToolMode::InText => {
                Some(text_protocol::default_continuation_prompt())
            }
            None => None,
        };
        Self {
            tool_mode,
            context_chars: config
                .context_window_chars
                .unwrap_or_else(|| config.vendor.default_context_chars()),
            continuation_prompt,
        }
    }
}

/// One normalized record decoded from a vendor stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Visible text, in emission order
    TextDelta(String),
    /// A fragment of a streamed tool call, keyed by the vendor's call index
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// The vendor closed the tool-call block at `index`
    ToolCallEnd { index: usize },
    /// A whole tool call delivered at once
    ToolCallComplete {
        id: Option<String>,
        name: String,
        arguments: Value,
    },
    /// Terminal reason code for the response
    Finish { reason: Option<String> },
}

/// Ordered, finite, non-restartable stream of decoded events.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Text projection of an [`EventStream`].
pub type TextStream = BoxStream<'static, Result<String>>;

/// Everything an adapter needs for one round.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The user's prompt for this exchange
    pub prompt: String,
    /// Assembled system instruction
    pub system: String,
    /// Prior conversation
    pub history: Vec<Message>,
    /// Tools to advertise natively
    pub tools: Option<Vec<ToolDefinition>>,
    /// Full message list replacing `history` + `prompt` (follow-up rounds)
    pub messages: Option<Vec<Message>>,
}

impl ChatRequest {
    /// Messages to send, without the system instruction.
    pub fn conversation(&self) -> Cow<'_, [Message]> {
        match &self.messages {
            Some(messages) => Cow::Borrowed(messages.as_slice()),
            None => {
                let mut messages = self.history.clone();
                messages.push(Message::user(&self.prompt));
                Cow::Owned(messages)
            }
        }
    }

    /// Tool definitions to put on the wire, if the profile uses native calls.
    pub fn native_tools(&self, profile: &ProviderProfile) -> Option<&[ToolDefinition]> {
        if profile.tool_mode != ToolMode::Native {
            return None;
        }
        self.tools.as_deref().filter(|tools| !tools.is_empty())
    }

    /// Conversation as sent to the vendor: in in-text mode, tool calls are
    /// rendered back into `<tool_call>` blocks and results become user turns.
    pub fn wire_messages(&self, profile: &ProviderProfile) -> Vec<Message> {
        let conversation = self.conversation();
        match profile.tool_mode {
            ToolMode::Native => conversation.into_owned(),
            ToolMode::InText => conversation
                .iter()
                .map(|msg| match msg.role {
                    Role::Tool => Message::user(text_protocol::render_tool_result(
                        msg.name.as_deref().unwrap_or("tool"),
                        &msg.content,
                    )),
                    Role::Assistant if !msg.calls().is_empty() => {
                        let mut content = msg.content.clone();
                        for call in msg.calls() {
                            if !content.is_empty() {
                                content.push('\n');
                            }
                            content.push_str(&text_protocol::render_call_block(call));
                        }
                        Message::assistant(content)
                    }
                    _ => msg.clone(),
                })
                .collect(),
        }
    }
}

/// Provider adapter trait — swappable vendor strategy.
///
/// Implement this trait to add a new vendor.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Vendor identity, carried by transport errors.
    fn vendor(&self) -> Vendor;

    /// Protocol settings the loop and prompt assembler follow.
    fn profile(&self) -> &ProviderProfile;

    /// Open the connection and decode the vendor's framing.
    async fn open(&self, request: &ChatRequest) -> Result<EventStream>;

    /// Text fragments only, in emission order.
    async fn stream_text(&self, request: &ChatRequest) -> Result<TextStream> {
        let events = self.open(request).await?;
        Ok(text_projection(events))
    }
}

/// Keep only the text of an event stream; errors pass through.
pub fn text_projection(events: EventStream) -> TextStream {
    events
        .filter_map(|item| async move {
            match item {
                Ok(StreamEvent::TextDelta(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
        .boxed()
}

/// Provider registry — selects the adapter for an exchange.
///
/// # Example
///
/// ```ignore
/// let adapter = ProviderRegistry::create(&config.provider)?;
/// let mut text = adapter.stream_text(&request).await?;
/// ```
pub struct ProviderRegistry;

impl ProviderRegistry {
    /// Create an adapter from configuration.
    ///
    /// Fails with `Error::Config` when a keyed vendor has no API key.
    pub fn create(config: &ProviderConfig) -> Result<std::sync::Arc<dyn ProviderAdapter>> {
        if config.vendor.requires_api_key() && config.api_key.trim().is_empty() {
            return Err(Error::Config(format!(
                "Missing API key for provider '{}'",
                config.vendor
            )));
        }
        Ok(match config.vendor {
            Vendor::OpenAi => std::sync::Arc::new(OpenAiAdapter::new(config)),
            Vendor::Anthropic => std::sync::Arc::new(AnthropicAdapter::new(config)),
            Vendor::Ollama => std::sync::Arc::new(OllamaAdapter::new(config)),
            Vendor::Gemini => std::sync::Arc::new(GeminiAdapter::new(config)),
        })
    }

    /// List available provider names.
    pub fn available() -> &'static [&'static str] {
        &["openai", "anthropic", "ollama", "gemini"]
    }
}

/// One scripted round for [`ScriptedAdapter`].
#[cfg(test)]
pub enum ScriptedRound {
    /// Emit these events, then end the stream
    Events(Vec<StreamEvent>),
    /// Emit these events, then never finish
    Stall(Vec<StreamEvent>),
    /// Emit these events, then fail with a transport error
    FailAfter(Vec<StreamEvent>, String),
}

/// Fake adapter for testing: replays scripted rounds and records requests.
#[cfg(test)]
pub struct ScriptedAdapter {
    profile: ProviderProfile,
    rounds: std::sync::Mutex<std::collections::VecDeque<ScriptedRound>>,
    pub requests: std::sync::Mutex<Vec<ChatRequest>>,
}

#[cfg(test)]
impl ScriptedAdapter {
    pub fn new(tool_mode: ToolMode, rounds: Vec<ScriptedRound>) -> Self {
        Self {
            profile: ProviderProfile {
                tool_mode,
                context_chars: 10_000,
                continuation_prompt: None,
            },
            rounds: std::sync::Mutex::new(rounds.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Rounds that answer with plain text.
    pub fn text(rounds: Vec<&str>) -> Self {
        Self::new(
            ToolMode::Native,
            rounds
                .into_iter()
                .map(|t| ScriptedRound::Events(vec![StreamEvent::TextDelta(t.to_string())]))
                .collect(),
        )
    }

    pub fn with_continuation(mut self, prompt: &str) -> Self {
        self.profile.continuation_prompt = Some(prompt.to_string());
        self
    }

    pub fn recorded(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn open(&self, request: &ChatRequest) -> Result<EventStream> {
        use futures_util::stream;

        self.requests.lock().unwrap().push(request.clone());
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::transport(Vendor::OpenAi, "No more scripted rounds"))?;
        Ok(match round {
            ScriptedRound::Events(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            ScriptedRound::Stall(events) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            ScriptedRound::FailAfter(events, message) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::once(async move {
                    Err(Error::transport(Vendor::OpenAi, message))
                }))
                .boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::framing::test_support::{chunked, collect, text_of};
    use super::*;
    use crate::agent::ToolCall;
    use serde_json::json;

    const DELTAS: [&str; 4] = ["Hel", "lo, ", "wörld", "!\n\"quoted\""];

    fn openai_wire(deltas: &[&str]) -> Vec<String> {
        let mut frames: Vec<String> = deltas
            .iter()
            .map(|d| {
                let chunk = json!({"choices": [{"index": 0, "delta": {"content": d}}]});
                format!("data: {}\n\n", chunk)
            })
            .collect();
        frames.push("data: [DONE]\n\n".to_string());
        frames
    }

    fn anthropic_wire(deltas: &[&str]) -> Vec<String> {
        let mut frames = vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n".to_string(),
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n".to_string(),
        ];
        for d in deltas {
            let data = json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": d}});
            frames.push(format!("event: content_block_delta\ndata: {}\n\n", data));
        }
        frames.push("event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n".to_string());
        frames.push("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string());
        frames
    }

    fn ollama_wire(deltas: &[&str]) -> Vec<String> {
        let mut frames: Vec<String> = deltas
            .iter()
            .map(|d| format!("{}\n", json!({"message": {"role": "assistant", "content": d}, "done": false})))
            .collect();
        frames.push(format!("{}\n", json!({"message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop"})));
        frames
    }

    fn gemini_wire(deltas: &[&str]) -> String {
        let parts: Vec<Value> = deltas.iter().map(|d| json!({"text": d})).collect();
        json!({"candidates": [{"content": {"role": "model", "parts": parts}, "finishReason": "STOP"}]}).to_string()
    }

    #[tokio::test]
    async fn test_same_deltas_same_text_for_every_framing() {
        let expected: String = DELTAS.concat();

        let (events, err) = collect(openai::decode_stream(chunked(openai_wire(&DELTAS)), false)).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), expected);

        let (events, err) = collect(anthropic::decode_stream(chunked(anthropic_wire(&DELTAS)), false)).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), expected);

        let (events, err) = collect(ollama::decode_stream(chunked(ollama_wire(&DELTAS)), false)).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), expected);

        let events = gemini::decode_document(gemini_wire(&DELTAS).as_bytes()).unwrap();
        assert_eq!(text_of(&events), expected);
    }

    #[tokio::test]
    async fn test_text_invariant_under_rechunking() {
        // Same OpenAI wire bytes, delivered one byte-ish slice at a time.
        let wire: String = openai_wire(&DELTAS).concat();
        let chunks: Vec<String> = wire
            .chars()
            .collect::<Vec<_>>()
            .chunks(7)
            .map(|c| c.iter().collect())
            .collect();
        let (events, err) = collect(openai::decode_stream(chunked(chunks), false)).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), DELTAS.concat());
    }

    #[tokio::test]
    async fn test_text_projection_drops_tool_events() {
        use futures_util::stream;

        let events: EventStream = stream::iter(vec![
            Ok(StreamEvent::TextDelta("a".to_string())),
            Ok(StreamEvent::ToolCallEnd { index: 0 }),
            Ok(StreamEvent::TextDelta("b".to_string())),
            Ok(StreamEvent::Finish { reason: None }),
        ])
        .boxed();
        let text: Vec<String> = text_projection(events)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(text, vec!["a", "b"]);
    }

    #[test]
    fn test_registry_requires_key() {
        let config = ProviderConfig {
            vendor: Vendor::Anthropic,
            ..ProviderConfig::default()
        };
        assert!(matches!(ProviderRegistry::create(&config), Err(Error::Config(_))));

        let config = ProviderConfig {
            vendor: Vendor::Ollama,
            ..ProviderConfig::default()
        };
        let adapter = ProviderRegistry::create(&config).unwrap();
        assert_eq!(adapter.vendor(), Vendor::Ollama);
        assert_eq!(adapter.profile().tool_mode, ToolMode::InText);
        assert!(adapter.profile().continuation_prompt.is_some());
    }

    #[test]
    fn test_profile_overrides() {
        let config = ProviderConfig {
            vendor: Vendor::Ollama,
            tool_mode: Some(ToolMode::Native),
            context_window_chars: Some(500),
            ..ProviderConfig::default()
        };
        let profile = ProviderProfile::for_config(&config);
        assert_eq!(profile.tool_mode, ToolMode::Native);
        assert_eq!(profile.context_chars, 500);
        assert_eq!(profile.continuation_prompt, None);

        let config = ProviderConfig {
            vendor: Vendor::OpenAi,
            continuation_prompt: Some("Keep going.".to_string()),
            ..ProviderConfig::default()
        };
        let profile = ProviderProfile::for_config(&config);
        assert_eq!(profile.continuation_prompt.as_deref(), Some("Keep going."));
    }

    #[test]
    fn test_conversation_override() {
        let request = ChatRequest {
            prompt: "hi".to_string(),
            history: vec![Message::assistant("earlier")],
            ..ChatRequest::default()
        };
        let conversation = request.conversation();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation[1].content, "hi");

        let request = ChatRequest {
            messages: Some(vec![Message::user("only")]),
            ..request
        };
        assert_eq!(request.conversation().len(), 1);
    }

    #[test]
    fn test_wire_messages_in_text_mode() {
        let mut call = ToolCall::pending("call_0", "read_file");
        call.args = json!({"path": "notes.md"});
        let request = ChatRequest {
            messages: Some(vec![
                Message::user("read notes.md"),
                Message::assistant_with_tools("Reading.", vec![call]),
                Message::tool_result("call_0", "read_file", "# Notes"),
            ]),
            ..ChatRequest::default()
        };
        let profile = ProviderProfile {
            tool_mode: ToolMode::InText,
            context_chars: 1000,
            continuation_prompt: None,
        };
        let wire = request.wire_messages(&profile);
        assert_eq!(wire[1].role, Role::Assistant);
        assert!(wire[1].content.starts_with("Reading.\n<tool_call>"));
        assert_eq!(wire[2].role, Role::User);
        assert!(wire[2].content.contains("# Notes"));
        assert!(wire.iter().all(|m| m.tool_calls.is_none()));
    }
}
