//! Tools module - capabilities the model can call
//!
//! Built-in tools read the user's notes and query the knowledge base. Tools
//! can also come from an external [`ToolGateway`] or from the host through a
//! [`ToolCallback`]; [`ToolRegistry`] resolves a name across all three.

mod filesystem;
mod knowledge;
mod recovery;
mod runner;
mod search;

pub use filesystem::{ListFilesTool, ReadFileTool};
pub use knowledge::{KnowledgeSearch, SearchHit, SearchKnowledgeBaseTool, SearchResults};
pub use recovery::{default_rules, RecoveryRule};
pub use runner::{ToolDefinition, ToolOutcome, ToolRegistry, DEFAULT_MAX_RESULT_CHARS};
pub use search::VaultSearch;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::Result;

/// Tool trait - interface for all built-in tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used in function calls
    fn name(&self) -> &str;

    /// Description of what the tool does
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters(&self) -> Value;

    /// Execute the tool with given parameters
    async fn execute(&self, params: Value) -> Result<Value>;

    /// Convert to tool definition for the model
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// A tool advertised by a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

impl From<ToolDescriptor> for ToolDefinition {
    fn from(d: ToolDescriptor) -> Self {
        ToolDefinition {
            name: d.name,
            description: d.description,
            parameters: d.input_schema,
        }
    }
}

/// External tool-invocation process. Opaque; the transport is the
/// implementor's business.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn get_tools(&self) -> Result<Vec<ToolDescriptor>>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value>;
}

/// Host-supplied execution hook, invoked once per resolved call.
#[async_trait]
pub trait ToolCallback: Send + Sync {
    async fn call(&self, name: &str, args: Value) -> Result<Value>;

    /// Tools the host wants advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// Adapts a closure into a [`ToolCallback`].
pub struct FnToolCallback<F> {
    f: F,
    definitions: Vec<ToolDefinition>,
}

impl<F> FnToolCallback<F>
where
    F: Fn(String, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    pub fn new(definitions: Vec<ToolDefinition>, f: F) -> Self {
        Self { f, definitions }
    }
}

#[async_trait]
impl<F> ToolCallback for FnToolCallback<F>
where
    F: Fn(String, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    async fn call(&self, name: &str, args: Value) -> Result<Value> {
        (self.f)(name.to_string(), args).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

/// Fixed-result tool for testing
#[cfg(test)]
pub struct DummyTool {
    pub name: String,
    pub result: std::result::Result<Value, String>,
}

#[cfg(test)]
#[async_trait]
impl Tool for DummyTool {
    fn name(&self) -> &str { &self.name }
    fn description(&self) -> &str { "Dummy tool for testing" }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        self.result
            .clone()
            .map_err(crate::error::Error::Tool)
    }
}
