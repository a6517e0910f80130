//! Agent module — streaming AI orchestration.
//!
//! This module contains:
//! - Message and tool-call types
//! - Provider adapters for each vendor wire format
//! - Tool-call accumulation and the in-text tool protocol
//! - Prompt assembly
//! - The bounded multi-round agent loop
//!
//! # Adding a New Provider
//!
//! See [`llm::ProviderRegistry`] for instructions.

mod accumulator;
mod loop_impl;
mod message;
pub mod prompt;
pub mod text_protocol;
pub mod tokens;

// Providers in submodule
pub mod llm;

// Re-exports for convenience
pub use accumulator::{CallSlot, SlotChange, SlotInput, ToolCallAccumulator, ToolEventCallback};
pub use llm::{ChatRequest, ProviderAdapter, ProviderRegistry, StreamEvent, ToolMode, Vendor};
pub use loop_impl::{AgentLoop, ExchangeEnd, ExchangeEvent, ExchangeOutcome, ExchangeRequest};
pub use message::{Message, Role, ToolCall, ToolStatus};
pub use prompt::{assemble, ContextSource, PromptInput, SourceDocument};
