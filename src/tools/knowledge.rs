//! Knowledge-base search capability and the `search_knowledge_base` tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::error::Error;
use crate::Result;

use super::Tool;

/// One matching note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub title: String,
    pub snippet: String,
    pub score: f32,
}

/// Hits plus a context block ready to inject into a prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub results: Vec<SearchHit>,
    pub context: String,
}

/// Search engine over the user's notes. Ranking and indexing are the
/// implementor's business.
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search_with_results(
        &self,
        query: &str,
        config: &ProviderConfig,
        max_results: usize,
    ) -> Result<SearchResults>;
}

/// Built-in tool backed by a [`KnowledgeSearch`].
pub struct SearchKnowledgeBaseTool {
    search: Arc<dyn KnowledgeSearch>,
    config: ProviderConfig,
    max_results: usize,
}

impl SearchKnowledgeBaseTool {
    pub fn new(search: Arc<dyn KnowledgeSearch>, config: ProviderConfig, max_results: usize) -> Self {
        Self {
            search,
            config,
            max_results,
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeBaseTool {
    fn name(&self) -> &str { "search_knowledge_base" }
    fn description(&self) -> &str {
        "Search the user's notes for passages relevant to a query. Returns the best matching \
         notes with short excerpts."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of notes to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let query = params.get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| Error::Tool("Missing 'query' parameter".to_string()))?;

        let max_results = params.get("max_results")
            .and_then(|v| v.as_u64())
            .map(|n| (n as usize).clamp(1, self.max_results.max(1)))
            .unwrap_or(self.max_results);

        let found = self
            .search
            .search_with_results(query, &self.config, max_results)
            .await?;

        if found.results.is_empty() {
            return Ok(json!(format!("No notes matched '{}'.", query)));
        }
        let sources: Vec<&str> = found.results.iter().map(|h| h.path.as_str()).collect();
        Ok(json!({
            "context": found.context,
            "sources": sources,
        }))
    }
}
