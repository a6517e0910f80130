//! Gemini adapter (API key authentication).
//!
//! Wire format: a single unframed JSON document from `generateContent`. The
//! whole body is read, then replayed as normalized events.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::Error;
use crate::tools::ToolDefinition;
use crate::Result;

use crate::agent::message::{Message, Role};
use super::framing::{check_status, send_error};
use super::types::{GeminiErrorBody, GeminiResponse};
use super::{ChatRequest, EventStream, ProviderAdapter, ProviderProfile, StreamEvent, Vendor};

/// Gemini API client using API key authentication.
#[derive(Clone)]
pub struct GeminiAdapter {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    debug_wire: bool,
    profile: ProviderProfile,
    client: Client,
}

impl GeminiAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            endpoint: config.endpoint_url(),
            api_key: config.api_key.clone(),
            model: config.model_name().to_string(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            debug_wire: config.debug_wire,
            profile: ProviderProfile::for_config(config),
            client: Client::new(),
        }
    }

    fn build_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        let mut contents: Vec<Value> = Vec::new();
        for m in messages.iter().filter(|m| m.role != Role::System) {
            let (role, parts) = match m.role {
                // Function responses travel in a user turn, keyed by tool name.
                Role::Tool => (
                    "user",
                    vec![json!({
                        "functionResponse": {
                            "name": m.name.as_deref().unwrap_or("unknown"),
                            "response": {"result": m.content}
                        }
                    })],
                ),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !m.content.is_empty() {
                        parts.push(json!({"text": m.content}));
                    }
                    parts.extend(m.calls().iter().map(|tc| {
                        json!({
                            "functionCall": {
                                "name": tc.name,
                                "args": tc.args
                            }
                        })
                    }));
                    ("model", parts)
                }
                _ => ("user", vec![json!({"text": m.content})]),
            };
            if parts.is_empty() {
                continue;
            }

            // Consecutive turns of one role are merged into one content.
            if let Some(last) = contents.last_mut() {
                if last["role"] == role {
                    if let Some(existing) = last["parts"].as_array_mut() {
                        existing.extend(parts);
                        continue;
                    }
                }
            }
            contents.push(json!({"role": role, "parts": parts}));
        }
        contents
    }

    fn convert_tools(&self, tools: &[ToolDefinition]) -> Value {
        let function_declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters
                })
            })
            .collect();

        json!([{
            "functionDeclarations": function_declarations
        }])
    }

    /// Request body for one round.
    pub fn build_body(&self, request: &ChatRequest) -> Value {
        let messages = request.wire_messages(&self.profile);
        let mut body = json!({
            "contents": self.convert_messages(&messages),
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens
            }
        });

        let mut system = request.system.clone();
        for m in messages.iter().filter(|m| m.role == Role::System) {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&m.content);
        }
        if !system.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{"text": system}]
            });
        }

        if let Some(tools) = request.native_tools(&self.profile) {
            body["tools"] = self.convert_tools(tools);
        }
        body
    }
}

/// Decode a complete `generateContent` document into normalized events.
///
/// A document that does not parse, an error body, or a response without
/// candidates is a transport error.
pub fn decode_document(body: &[u8]) -> Result<Vec<StreamEvent>> {
    let response: GeminiResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(parse_err) => {
            let message = match serde_json::from_slice::<GeminiErrorBody>(body) {
                Ok(body) => format!("{}: {}", body.error.status, body.error.message),
                Err(_) => format!("unparseable response: {}", parse_err),
            };
            return Err(Error::transport(Vendor::Gemini, message));
        }
    };

    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .map(|r| format!(" (blocked: {})", r))
            .unwrap_or_default();
        return Err(Error::transport(
            Vendor::Gemini,
            format!("No candidates in response{}", reason),
        ));
    };

    if let Some(usage) = &response.usage_metadata {
        debug!(
            "Gemini usage: prompt={:?} candidates={:?}",
            usage.prompt_token_count, usage.candidates_token_count
        );
    }

    let mut events = Vec::new();
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text));
            }
        }
        if let Some(fc) = part.function_call {
            events.push(StreamEvent::ToolCallComplete {
                id: None,
                name: fc.name,
                arguments: fc.args,
            });
        }
    }
    events.push(StreamEvent::Finish {
        reason: candidate.finish_reason,
    });
    Ok(events)
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Gemini
    }

    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    async fn open(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request);
        debug!("Gemini request for model {}", self.model);

        let response = self
            .client
            .post(self.build_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(Vendor::Gemini, e))?;
        let response = check_status(Vendor::Gemini, response).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(Vendor::Gemini, format!("body read failed: {}", e)))?;
        if self.debug_wire {
            debug!("gemini document: {}", String::from_utf8_lossy(&bytes));
        }

        let events = decode_document(&bytes)?;
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::super::framing::test_support::{collect, text_of};
    use super::*;
    use crate::agent::ToolCall;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(endpoint: Option<String>) -> GeminiAdapter {
        GeminiAdapter::new(&ProviderConfig {
            vendor: Vendor::Gemini,
            endpoint,
            api_key: "k".to_string(),
            ..ProviderConfig::default()
        })
    }

    #[test]
    fn test_decode_text_and_function_call() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Let me look."},
                    {"functionCall": {"name": "read_file", "args": {"path": "notes.md"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10}
        });
        let events = decode_document(body.to_string().as_bytes()).unwrap();
        assert_eq!(text_of(&events), "Let me look.");
        assert_eq!(
            events[1],
            StreamEvent::ToolCallComplete {
                id: None,
                name: "read_file".to_string(),
                arguments: json!({"path": "notes.md"}),
            }
        );
        assert_eq!(events[2], StreamEvent::Finish { reason: Some("STOP".to_string()) });
    }

    #[test]
    fn test_truncated_document_is_transport_error() {
        let err = decode_document(br#"{"candidates": [{"content": {"parts": [{"te"#).unwrap_err();
        assert!(matches!(err, Error::Transport { vendor: Vendor::Gemini, .. }));
    }

    #[test]
    fn test_no_candidates_reports_block_reason() {
        let err = decode_document(br#"{"promptFeedback": {"blockReason": "SAFETY"}}"#).unwrap_err();
        assert!(err.message().contains("SAFETY"));
    }

    #[test]
    fn test_function_response_uses_tool_name() {
        let mut call = ToolCall::pending("tc_0", "read_file");
        call.args = json!({"path": "a.md"});
        let request = ChatRequest {
            system: "sys".to_string(),
            messages: Some(vec![
                Message::user("read a.md"),
                Message::assistant_with_tools("", vec![call]),
                Message::tool_result("tc_0", "read_file", "A"),
            ]),
            ..ChatRequest::default()
        };
        let body = adapter(None).build_body(&request);
        let contents = body["contents"].as_array().unwrap();
        // The function response merges into a user turn after the model turn.
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "read_file");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[tokio::test]
    async fn test_open_replays_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "Hi"}, {"text": " there"}]}, "finishReason": "STOP"}]
            })))
            .mount(&server)
            .await;

        let stream = adapter(Some(server.uri())).open(&ChatRequest::default()).await.unwrap();
        let (events, err) = collect(stream).await;
        assert!(err.is_none());
        assert_eq!(text_of(&events), "Hi there");
    }

    #[tokio::test]
    async fn test_error_body_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("API key not valid"))
            .mount(&server)
            .await;
        let err = adapter(Some(server.uri()))
            .open(&ChatRequest::default())
            .await
            .err()
            .unwrap();
        assert!(err.message().contains("HTTP 400"));
    }

    #[tokio::test]
    async fn test_connection_error_does_not_leak_key() {
        // Nothing listens on port 1.
        let adapter = GeminiAdapter::new(&ProviderConfig {
            vendor: Vendor::Gemini,
            endpoint: Some("http://127.0.0.1:1".to_string()),
            api_key: "secret-gemini-key".to_string(),
            ..ProviderConfig::default()
        });
        let err = adapter.open(&ChatRequest::default()).await.err().unwrap();
        assert!(err.is_transport());
        assert!(!err.message().contains("secret-gemini-key"));
        assert!(!err.to_string().contains("secret-gemini-key"));
    }
}
