//! Agent loop - bounded multi-round orchestration
//!
//! One exchange answers one prompt. Each round streams a response through the
//! provider adapter; closed tool calls are executed one by one and their
//! results fed into the next round, until the model answers without tools,
//! emits the completion sentinel, or a ceiling is hit.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestrationConfig;
use crate::error::Error;
use crate::tools::ToolRegistry;
use crate::Result;

use super::accumulator::{ToolCallAccumulator, ToolEventCallback};
use super::llm::{ChatRequest, ProviderAdapter, StreamEvent, ToolMode};
use super::message::{Message, ToolCall};
use super::prompt::{assemble, ContextSource, PromptInput};
use super::text_protocol::{parse_tool_blocks, strip_sentinel, SentinelFilter, ToolBlockFilter};
use super::tokens::estimate_tokens;

/// Progress reported to the host while an exchange runs.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    RoundStarted { round: usize },
    /// Visible text, in emission order
    TextDelta(String),
    /// A tool call changed status
    ToolCall(ToolCall),
    /// Out-of-band message: timeouts, failures after partial output
    Notice(String),
}

/// Why an exchange stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEnd {
    /// A round finished without tool calls
    Done,
    /// The model emitted the completion sentinel
    Sentinel,
    /// A ceiling expired; text is partial
    TimedOut,
    Cancelled,
    /// `max_rounds` rounds ran and the model still wanted tools
    RoundLimit,
    /// Transport failure after some output was already shown
    Failed(String),
}

/// Result of one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// All visible text across rounds
    pub text: String,
    pub end: ExchangeEnd,
    pub rounds: usize,
    /// Every tool call seen, in order, with its final status
    pub tool_calls: Vec<ToolCall>,
}

/// Inputs for one exchange.
pub struct ExchangeRequest {
    pub prompt: String,
    pub language: Option<String>,
    pub context: ContextSource,
    pub file_list: Vec<String>,
    pub events: Option<UnboundedSender<ExchangeEvent>>,
    pub on_tool_event: Option<ToolEventCallback>,
    pub cancel: CancellationToken,
}

impl ExchangeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            language: None,
            context: ContextSource::None,
            file_list: Vec::new(),
            events: None,
            on_tool_event: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn context(mut self, context: ContextSource) -> Self {
        self.context = context;
        self
    }

    pub fn files(mut self, files: Vec<String>) -> Self {
        self.file_list = files;
        self
    }

    pub fn events(mut self, tx: UnboundedSender<ExchangeEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn on_tool_event(mut self, cb: ToolEventCallback) -> Self {
        self.on_tool_event = Some(cb);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// How a single round's stream ended.
enum RoundEnd {
    Finished,
    Sentinel,
    TimedOut,
    Cancelled,
    Failed(Error),
}

/// Per-round streaming state. Dropped at the end of the round.
struct RoundState {
    mode: ToolMode,
    /// Text after sentinel filtering, tool blocks included
    raw: String,
    /// Text shown to the caller
    visible: String,
    sentinel: SentinelFilter,
    blocks: ToolBlockFilter,
    accumulator: ToolCallAccumulator,
}

impl RoundState {
    fn new(mode: ToolMode, on_event: Option<ToolEventCallback>) -> Self {
        Self {
            mode,
            raw: String::new(),
            visible: String::new(),
            sentinel: SentinelFilter::new(),
            blocks: ToolBlockFilter::new(),
            accumulator: ToolCallAccumulator::new(on_event),
        }
    }

    /// Project one event into text and tool calls. Returns visible text.
    fn observe(&mut self, event: &StreamEvent) -> String {
        self.accumulator.observe(event);
        let StreamEvent::TextDelta(delta) = event else {
            return String::new();
        };
        let visible = match self.mode {
            ToolMode::Native => delta.clone(),
            ToolMode::InText => {
                let (text, _) = self.sentinel.push(delta);
                self.raw.push_str(&text);
                self.blocks.push(&text)
            }
        };
        self.visible.push_str(&visible);
        visible
    }

    fn sentinel_seen(&self) -> bool {
        self.sentinel.seen()
    }

    /// Flush held-back text; in in-text mode, turn closed blocks into calls.
    fn flush(&mut self) -> String {
        if self.mode == ToolMode::Native {
            return String::new();
        }
        let tail = self.sentinel.finish();
        self.raw.push_str(&tail);
        let mut visible = self.blocks.push(&tail);
        visible.push_str(&self.blocks.finish());
        self.visible.push_str(&visible);

        if !self.sentinel_seen() {
            let (calls, _) = parse_tool_blocks(&self.raw);
            for call in calls {
                self.accumulator.complete_atomic(None, call.name, call.arguments);
            }
        }
        visible
    }
}

/// The agent loop drives one exchange at a time
pub struct AgentLoop {
    adapter: Arc<dyn ProviderAdapter>,
    registry: Option<Arc<ToolRegistry>>,
    base_instruction: String,
    max_rounds: usize,
    round_timeout: Duration,
    exchange_timeout: Duration,
}

impl AgentLoop {
    /// Create a new agent loop
    pub fn new(adapter: Arc<dyn ProviderAdapter>, config: &OrchestrationConfig) -> Self {
        Self {
            adapter,
            registry: None,
            base_instruction: String::new(),
            max_rounds: config.max_rounds.max(1),
            round_timeout: config.round_timeout(),
            exchange_timeout: config.exchange_timeout(),
        }
    }

    /// Attach the tool registry. Without one, tool calls are not executed.
    pub fn with_tools(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.base_instruction = instruction.into();
        self
    }

    pub fn with_timeouts(mut self, round: Duration, exchange: Duration) -> Self {
        self.round_timeout = round;
        self.exchange_timeout = exchange;
        self
    }

    /// Run one exchange against `history`.
    ///
    /// The user prompt, each round's assistant message and every tool result
    /// are appended to `history`. Only setup and transport errors that occur
    /// before any output is produced are returned as `Err`.
    pub async fn run(&self, history: &mut Vec<Message>, request: ExchangeRequest) -> Result<ExchangeOutcome> {
        let deadline = deadline_after(self.exchange_timeout);
        let profile = self.adapter.profile().clone();
        let tools = self
            .registry
            .as_ref()
            .map(|r| r.definitions())
            .unwrap_or_default();

        let system = assemble(&PromptInput {
            base_instruction: &self.base_instruction,
            tools: &tools,
            tool_mode: profile.tool_mode,
            language: request.language.as_deref(),
            file_list: &request.file_list,
            context: &request.context,
            context_chars: profile.context_chars,
        });

        debug!(
            "System prompt: {} chars, ~{} tokens",
            system.len(),
            estimate_tokens(&system)
        );

        let events = request.events.clone();
        let emit = |event: ExchangeEvent| {
            if let Some(tx) = &events {
                // The host may have stopped listening; the exchange goes on.
                let _ = tx.send(event);
            }
        };
        let report: ToolEventCallback = {
            let host = request.on_tool_event.clone();
            let tx = request.events.clone();
            Arc::new(move |call: &ToolCall| {
                if let Some(cb) = &host {
                    cb(call);
                }
                if let Some(tx) = &tx {
                    let _ = tx.send(ExchangeEvent::ToolCall(call.clone()));
                }
            })
        };

        info!("Starting exchange: {} chars of prompt", request.prompt.len());
        let prior = history.clone();
        history.push(Message::user(&request.prompt));

        let mut text = String::new();
        let mut all_calls: Vec<ToolCall> = Vec::new();
        let mut end = ExchangeEnd::RoundLimit;
        let mut rounds = 0;

        for round in 1..=self.max_rounds {
            if request.cancel.is_cancelled() {
                end = ExchangeEnd::Cancelled;
                break;
            }
            if Instant::now() >= deadline {
                end = ExchangeEnd::TimedOut;
                break;
            }
            rounds = round;
            debug!("Round {}/{}", round, self.max_rounds);
            emit(ExchangeEvent::RoundStarted { round });

            let chat = if round == 1 {
                ChatRequest {
                    prompt: request.prompt.clone(),
                    system: system.clone(),
                    history: prior.clone(),
                    tools: Some(tools.clone()),
                    messages: None,
                }
            } else {
                let mut messages = history.clone();
                if let Some(prompt) = &profile.continuation_prompt {
                    messages.push(Message::user(prompt));
                }
                ChatRequest {
                    prompt: request.prompt.clone(),
                    system: system.clone(),
                    history: prior.clone(),
                    tools: Some(tools.clone()),
                    messages: Some(messages),
                }
            };

            let round_deadline = std::cmp::min(deadline_after(self.round_timeout), deadline);
            let mut state = RoundState::new(profile.tool_mode, Some(report.clone()));
            let round_start = text.len();

            let round_end = {
                let adapter = &self.adapter;
                let state = &mut state;
                let text = &mut text;
                let emit = &emit;
                let drive = async move {
                    let mut stream = adapter.open(&chat).await?;
                    while let Some(item) = stream.next().await {
                        let visible = state.observe(&item?);
                        push_visible(text, &visible, state.visible.len() == visible.len(), emit);
                        if state.sentinel_seen() {
                            return Ok(RoundEnd::Sentinel);
                        }
                    }
                    Ok::<_, Error>(RoundEnd::Finished)
                };
                // Dropping `drive` drops the stream, which aborts the read.
                tokio::select! {
                    biased;
                    _ = request.cancel.cancelled() => RoundEnd::Cancelled,
                    _ = sleep_until(round_deadline) => RoundEnd::TimedOut,
                    result = drive => result.unwrap_or_else(RoundEnd::Failed),
                }
            };

            let first_chunk = state.visible.is_empty();
            let tail = state.flush();
            push_visible(&mut text, &tail, first_chunk, &emit);
            let round_text = text[round_start..].trim_start().to_string();

            match round_end {
                // A clean end of stream closes whatever is still streaming.
                RoundEnd::Finished => state.accumulator.close_all(),
                RoundEnd::Sentinel => {
                    info!("Completion sentinel in round {}", round);
                    all_calls.extend(state.accumulator.abandon_open("superseded by completion"));
                    finalize(history, &round_text);
                    end = ExchangeEnd::Sentinel;
                    break;
                }
                RoundEnd::Cancelled => {
                    info!("Exchange cancelled in round {}", round);
                    all_calls.extend(state.accumulator.abandon_open("cancelled"));
                    all_calls.extend(fail_all(state.accumulator.into_completed(), "cancelled", &report));
                    finalize(history, &round_text);
                    end = ExchangeEnd::Cancelled;
                    break;
                }
                RoundEnd::TimedOut if Instant::now() >= deadline => {
                    warn!("Exchange ceiling reached in round {}", round);
                    emit(ExchangeEvent::Notice(format!(
                        "Stopped after {:?}; the answer may be incomplete.",
                        self.exchange_timeout
                    )));
                    all_calls.extend(state.accumulator.abandon_open("exchange timed out"));
                    all_calls.extend(fail_all(state.accumulator.into_completed(), "exchange timed out", &report));
                    finalize(history, &round_text);
                    end = ExchangeEnd::TimedOut;
                    break;
                }
                RoundEnd::TimedOut => {
                    warn!("Round {} timed out; keeping partial output", round);
                    emit(ExchangeEvent::Notice(format!(
                        "Round {} timed out after {:?}; continuing with partial output.",
                        round, self.round_timeout
                    )));
                    all_calls.extend(state.accumulator.abandon_open("round timed out"));
                    end = ExchangeEnd::TimedOut;
                }
                RoundEnd::Failed(e) => {
                    let reason = e.message();
                    all_calls.extend(state.accumulator.abandon_open(&reason));
                    all_calls.extend(fail_all(state.accumulator.into_completed(), &reason, &report));
                    if text.is_empty() && all_calls.is_empty() {
                        warn!("Exchange failed before any output: {}", e);
                        history.truncate(prior.len());
                        return Err(e);
                    }
                    warn!("Exchange failed after partial output: {}", e);
                    emit(ExchangeEvent::Notice(format!("Error: {}", e)));
                    finalize(history, &round_text);
                    end = ExchangeEnd::Failed(e.message());
                    break;
                }
            }

            let calls = state.accumulator.into_completed();
            let Some(registry) = self.registry.as_ref().filter(|_| !calls.is_empty()) else {
                all_calls.extend(fail_all(calls, "no tool handler", &report));
                finalize(history, &round_text);
                if end != ExchangeEnd::TimedOut {
                    end = ExchangeEnd::Done;
                }
                info!("Exchange completed in {} rounds: {} chars", round, text.len());
                break;
            };

            info!("Round {}: executing {} tool calls", round, calls.len());
            let recent = format!("{}\n{}", request.prompt, text);
            let (executed, results, interrupted) = self
                .execute_calls(registry, calls, &recent, deadline, &request.cancel, &report)
                .await;

            history.push(Message::assistant_with_tools(round_text, executed.clone()));
            for (call, formatted) in executed.iter().zip(results) {
                history.push(Message::tool_result(&call.id, &call.name, formatted));
            }
            all_calls.extend(executed);

            if let Some(stop) = interrupted {
                end = stop;
                break;
            }
            end = ExchangeEnd::RoundLimit;
        }

        if end == ExchangeEnd::RoundLimit {
            warn!("Round limit of {} reached", self.max_rounds);
            emit(ExchangeEvent::Notice(format!(
                "Stopped after {} rounds of tool use.",
                self.max_rounds
            )));
        }

        Ok(ExchangeOutcome {
            text,
            end,
            rounds,
            tool_calls: all_calls,
        })
    }

    /// Run calls strictly in order. Returns the calls with their final
    /// status, the formatted result for each, and the reason execution
    /// stopped early, if it did.
    async fn execute_calls(
        &self,
        registry: &ToolRegistry,
        calls: Vec<ToolCall>,
        recent_text: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        report: &ToolEventCallback,
    ) -> (Vec<ToolCall>, Vec<String>, Option<ExchangeEnd>) {
        let mut executed = Vec::with_capacity(calls.len());
        let mut results = Vec::with_capacity(calls.len());
        let mut interrupted: Option<ExchangeEnd> = None;

        for mut call in calls {
            if let Some(reason) = &interrupted {
                let message = interruption_message(reason);
                call.fail(message, None);
                report(&call);
                results.push(format!("Error: {}", message));
                executed.push(call);
                continue;
            }

            call.start();
            report(&call);
            debug!("Executing tool: {} with args: {}", call.name, call.args);

            let mut args: Value = call.args.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ExchangeEnd::Cancelled),
                _ = sleep_until(deadline) => Err(ExchangeEnd::TimedOut),
                outcome = registry.execute(&call.name, &mut args, recent_text) => Ok(outcome),
            };
            call.args = args;

            match outcome {
                Ok(outcome) => {
                    if outcome.success {
                        call.succeed(outcome.result);
                    } else {
                        let message = outcome.error_message().unwrap_or("tool failed").to_string();
                        call.fail(message, Some(outcome.result));
                    }
                    results.push(outcome.formatted);
                }
                Err(reason) => {
                    let message = interruption_message(&reason);
                    call.fail(message, None);
                    results.push(format!("Error: {}", message));
                    interrupted = Some(reason);
                }
            }
            report(&call);
            executed.push(call);
        }
        (executed, results, interrupted)
    }
}

/// `now + timeout`, saturating to a far-future instant for huge ceilings.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Thirty years: effectively no ceiling.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn interruption_message(reason: &ExchangeEnd) -> &'static str {
    match reason {
        ExchangeEnd::Cancelled => "cancelled",
        _ => "exchange timed out",
    }
}

/// Append visible text, separating rounds with a blank line.
fn push_visible(text: &mut String, visible: &str, first_in_round: bool, emit: &impl Fn(ExchangeEvent)) {
    if visible.is_empty() {
        return;
    }
    let delta = if first_in_round && !text.is_empty() {
        format!("\n\n{}", visible)
    } else {
        visible.to_string()
    };
    text.push_str(&delta);
    emit(ExchangeEvent::TextDelta(delta));
}

/// Mark closed-but-unexecuted calls as failed.
fn fail_all(calls: Vec<ToolCall>, reason: &str, report: &ToolEventCallback) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.fail(reason, None) {
                report(&call);
            }
            call
        })
        .collect()
}

/// Record the round's text as the final assistant message.
fn finalize(history: &mut Vec<Message>, round_text: &str) {
    let content = strip_sentinel(round_text);
    if !content.trim().is_empty() {
        history.push(Message::assistant(content.trim_end()));
    }
}
