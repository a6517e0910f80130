//! Tool registry - resolves and executes tool calls
//!
//! Execution never fails: handler errors, unknown names and gateway failures
//! all come back as a [`ToolOutcome`] with `success: false`, so the model can
//! read the failure and react.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use crate::Result;
use crate::agent::tokens::truncate_with_marker;
use super::recovery::{default_rules, RecoveryRule};
use super::{Tool, ToolCallback, ToolDescriptor, ToolGateway};

/// Default cap on a formatted result.
pub const DEFAULT_MAX_RESULT_CHARS: usize = 8000;

/// Tool definition for the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Value,
    /// Bounded rendering for display and for the next round's request
    pub formatted: String,
}

impl ToolOutcome {
    fn ok(result: Value, max_chars: usize) -> Self {
        let formatted = truncate_with_marker(&render(&result), max_chars);
        Self {
            success: true,
            result,
            formatted,
        }
    }

    fn failed(message: String, max_chars: usize) -> Self {
        let formatted = truncate_with_marker(&format!("Error: {}", message), max_chars);
        Self {
            success: false,
            result: json!({ "error": message }),
            formatted,
        }
    }

    /// Error text when the call failed.
    pub fn error_message(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        self.result.get("error").and_then(Value::as_str)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Strings render as-is, everything else as pretty JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Registry of built-in, gateway and host tools
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    gateway: Option<Arc<dyn ToolGateway>>,
    gateway_tools: Vec<ToolDescriptor>,
    host: Option<Arc<dyn ToolCallback>>,
    recovery: Vec<RecoveryRule>,
    max_result_chars: usize,
}

impl ToolRegistry {
    /// Create an empty registry with the default recovery rules
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            gateway: None,
            gateway_tools: Vec::new(),
            host: None,
            recovery: default_rules(),
            max_result_chars: DEFAULT_MAX_RESULT_CHARS,
        }
    }

    /// Register a built-in tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ToolGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ToolCallback>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_recovery(mut self, rules: Vec<RecoveryRule>) -> Self {
        self.recovery = rules;
        self
    }

    pub fn with_max_result_chars(mut self, max_chars: usize) -> Self {
        self.max_result_chars = max_chars;
        self
    }

    /// Reload the gateway's tool list.
    pub async fn refresh_gateway(&mut self) -> Result<usize> {
        let Some(gateway) = &self.gateway else {
            return Ok(0);
        };
        self.gateway_tools = gateway.get_tools().await?;
        info!("Loaded {} gateway tools", self.gateway_tools.len());
        Ok(self.gateway_tools.len())
    }

    /// Definitions for every resolvable tool, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.extend(
            self.gateway_tools
                .iter()
                .filter(|d| !self.tools.contains_key(&d.name))
                .cloned()
                .map(ToolDefinition::from),
        );
        if let Some(host) = &self.host {
            for def in host.definitions() {
                if !defs.iter().any(|d| d.name == def.name) {
                    defs.push(def);
                }
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    ///
    /// `recent_text` (prompt plus the model's text so far) feeds the
    /// missing-argument recovery rules. `args` is passed back with any
    /// recovered values filled in.
    pub async fn execute(&self, name: &str, args: &mut Value, recent_text: &str) -> ToolOutcome {
        for rule in &self.recovery {
            rule.apply(name, args, recent_text);
        }
        debug!("Executing tool: {} with args: {}", name, args);

        let args = args.clone();
        let handler = async move {
            if let Some(tool) = self.tools.get(name) {
                Some(tool.execute(args).await)
            } else if let (Some(gateway), true) = (
                &self.gateway,
                self.gateway_tools.iter().any(|d| d.name == name),
            ) {
                Some(gateway.call_tool(name, args).await)
            } else if let Some(host) = &self.host {
                Some(host.call(name, args).await)
            } else {
                None
            }
        };

        // A panicking handler fails its call, not the exchange.
        let result = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Some(result)) => result,
            Ok(None) => {
                warn!("Unknown tool requested: {}", name);
                return ToolOutcome::failed(format!("Unknown tool: {}", name), self.max_result_chars);
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                warn!("Tool {} panicked: {}", name, message);
                return ToolOutcome::failed(format!("{} panicked: {}", name, message), self.max_result_chars);
            }
        };

        match result {
            Ok(value) => {
                let outcome = ToolOutcome::ok(value, self.max_result_chars);
                debug!("Tool {} succeeded: {} chars", name, outcome.formatted.len());
                outcome
            }
            Err(e) => {
                debug!("Tool {} failed: {}", name, e);
                ToolOutcome::failed(e.message(), self.max_result_chars)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
