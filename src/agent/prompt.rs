//! System instruction assembly.
//!
//! [`assemble`] is a pure function of its input: the same [`PromptInput`]
//! always yields the same bytes, so prompts can be tested without a network.

use serde_json::Value;

use crate::tools::ToolDefinition;

use super::llm::ToolMode;
use super::text_protocol::SENTINEL;
use super::tokens::truncate_chars;

/// A raw note passed in full instead of retrieved snippets.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub title: String,
    pub content: String,
}

impl SourceDocument {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Context injected after the instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ContextSource {
    #[default]
    None,
    /// A block already produced by knowledge search
    Retrieved(String),
    /// Raw documents, cut to the vendor's character budget
    Documents(Vec<SourceDocument>),
}

/// Everything the system instruction depends on.
#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub base_instruction: &'a str,
    pub tools: &'a [ToolDefinition],
    pub tool_mode: ToolMode,
    /// `None` answers in the language of the question
    pub language: Option<&'a str>,
    pub file_list: &'a [String],
    pub context: &'a ContextSource,
    /// Character budget for [`ContextSource::Documents`]
    pub context_chars: usize,
}

/// Compose the system instruction.
pub fn assemble(input: &PromptInput<'_>) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(5);
    sections.push(input.base_instruction.trim().to_string());

    if !input.tools.is_empty() {
        sections.push(match input.tool_mode {
            ToolMode::Native => native_guidance(input.tools),
            ToolMode::InText => in_text_guidance(input.tools),
        });
    }

    sections.push(language_directive(input.language));

    if !input.file_list.is_empty() {
        let files: Vec<String> = input.file_list.iter().map(|f| format!("- {}", f)).collect();
        sections.push(format!("## Available notes\n\n{}", files.join("\n")));
    }

    match input.context {
        ContextSource::None => {}
        ContextSource::Retrieved(block) if block.trim().is_empty() => {}
        ContextSource::Retrieved(block) => {
            sections.push(format!("## Relevant context\n\n{}", block.trim()));
        }
        ContextSource::Documents(docs) => {
            if let Some(block) = documents_block(docs, input.context_chars) {
                sections.push(block);
            }
        }
    }

    sections.join("\n\n")
}

fn native_guidance(tools: &[ToolDefinition]) -> String {
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    format!(
        "## Tools\n\nYou can call these tools: {}. Call a tool whenever the answer depends on \
         the user's notes instead of guessing. Call tools one at a time and wait for each \
         result before deciding the next step.",
        names.join(", ")
    )
}

fn in_text_guidance(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "## Tools\n\nTo call a tool, write a block in exactly this form and then stop:\n\n\
         <tool_call>{\"name\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}</tool_call>\n\n\
         The result will be sent back to you. Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!("\n- {}: {}", tool.name, tool.description));
        if let Some(params) = describe_parameters(&tool.parameters) {
            out.push_str(&format!("\n  arguments: {}", params));
        }
    }
    out.push_str(&format!(
        "\n\nWhen you have the final answer, write it without any tool_call block and end it \
         with {}.",
        SENTINEL
    ));
    out
}

/// `limit (integer), path (string, required)` from a JSON schema.
fn describe_parameters(schema: &Value) -> Option<String> {
    let props = schema.get("properties")?.as_object()?;
    if props.is_empty() {
        return None;
    }
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    // serde_json maps iterate in key order, so this is stable.
    let parts: Vec<String> = props
        .iter()
        .map(|(name, schema)| {
            let ty = schema.get("type").and_then(Value::as_str).unwrap_or("any");
            if required.contains(&name.as_str()) {
                format!("{} ({}, required)", name, ty)
            } else {
                format!("{} ({})", name, ty)
            }
        })
        .collect();
    Some(parts.join(", "))
}

fn language_directive(language: Option<&str>) -> String {
    match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(lang) => format!("Always answer in {}.", lang),
        None => "Answer in the same language as the user's question.".to_string(),
    }
}

/// Documents in order until the budget runs out; the last one may be cut.
fn documents_block(docs: &[SourceDocument], budget: usize) -> Option<String> {
    let mut remaining = budget;
    let mut parts = Vec::new();
    let mut omitted = 0;

    for doc in docs {
        if remaining == 0 {
            omitted += 1;
            continue;
        }
        let kept = truncate_chars(&doc.content, remaining);
        remaining -= kept.chars().count();
        let mut part = format!("### {}\n\n{}", doc.title, kept);
        if kept.len() < doc.content.len() {
            part.push_str("\n[... truncated]");
        }
        parts.push(part);
    }

    if parts.is_empty() {
        return None;
    }
    let mut block = format!("## Source notes\n\n{}", parts.join("\n\n"));
    if omitted > 0 {
        block.push_str(&format!("\n\n({} more notes omitted)", omitted));
    }
    Some(block)
}
