//! In-text tool protocol for vendors without native tool calls.
//!
//! The model writes one block per call:
//!
//! ```text
//! <tool_call>{"name": "read_file", "arguments": {"path": "notes.md"}}</tool_call>
//! ```
//!
//! and ends its final answer with [`SENTINEL`]. Blocks are parsed after the
//! round's stream ends; the sentinel is filtered while streaming so it never
//! reaches the caller.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use super::message::ToolCall;

/// Free-text completion marker.
pub const SENTINEL: &str = "[TASK_COMPLETE]";

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("static regex")
    })
}

/// Message appended after tool results so in-text models keep going.
pub fn default_continuation_prompt() -> String {
    format!(
        "Continue with the task using the tool results above. Call another tool if you \
         need more information, otherwise give your final answer and end it with {}.",
        SENTINEL
    )
}

/// Render a tool result as a user-visible transcript entry.
pub fn render_tool_result(name: &str, content: &str) -> String {
    format!("<tool_result name=\"{}\">\n{}\n</tool_result>", name, content)
}

/// Render a call back into the block form the model wrote.
pub fn render_call_block(call: &ToolCall) -> String {
    let body = json!({"name": call.name, "arguments": call.args});
    format!("{}{}{}", OPEN_TAG, body, CLOSE_TAG)
}

/// A call parsed out of the text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCall {
    pub name: String,
    pub arguments: Value,
}

/// Extract every `<tool_call>` block from `text`.
///
/// Returns the calls in order and the text with the blocks removed. A block
/// whose body is not JSON, or has no `name`, is dropped with a warning. A
/// body whose `arguments` is missing or not an object gets `{}`.
pub fn parse_tool_blocks(text: &str) -> (Vec<TextCall>, String) {
    let mut calls = Vec::new();
    for caps in block_regex().captures_iter(text) {
        let body = caps.get(1).map_or("", |m| m.as_str());
        let value: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring unparsable tool_call block: {}", e);
                continue;
            }
        };
        let Some(name) = value.get("name").and_then(Value::as_str) else {
            warn!("Ignoring tool_call block without a name");
            continue;
        };
        let arguments = match value.get("arguments") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            // Some models send arguments as an encoded string.
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(v @ Value::Object(_)) => v,
                _ => json!({}),
            },
            _ => json!({}),
        };
        calls.push(TextCall {
            name: name.to_string(),
            arguments,
        });
    }

    let stripped = block_regex().replace_all(text, "");
    (calls, stripped.trim().to_string())
}

/// Remove every occurrence of the sentinel.
pub fn strip_sentinel(text: &str) -> String {
    text.replace(SENTINEL, "")
}

/// Streaming filter that hides the sentinel from the caller.
///
/// Text that could be the start of the sentinel is held back until the next
/// delta decides it. Once the sentinel is seen, everything after it is
/// dropped.
#[derive(Debug, Default)]
pub struct SentinelFilter {
    pending: String,
    seen: bool,
}

impl SentinelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta. Returns the text safe to show and whether the
    /// sentinel has been seen.
    pub fn push(&mut self, delta: &str) -> (String, bool) {
        if self.seen {
            return (String::new(), true);
        }
        self.pending.push_str(delta);

        if let Some(pos) = self.pending.find(SENTINEL) {
            let visible = self.pending[..pos].to_string();
            self.pending.clear();
            self.seen = true;
            return (visible, true);
        }

        let hold = held_suffix_len(&self.pending, SENTINEL);
        let split = self.pending.len() - hold;
        let visible = self.pending[..split].to_string();
        self.pending.drain(..split);
        (visible, false)
    }

    /// Flush held-back text at end of stream.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    pub fn seen(&self) -> bool {
        self.seen
    }
}

/// Streaming filter that hides `<tool_call>` blocks from the caller.
///
/// Blocks are still parsed from the full round text; this only keeps the
/// raw JSON out of the live output.
#[derive(Debug, Default)]
pub struct ToolBlockFilter {
    pending: String,
    inside: bool,
}

impl ToolBlockFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta, returning the text outside any block.
    pub fn push(&mut self, delta: &str) -> String {
        self.pending.push_str(delta);
        let mut out = String::new();
        loop {
            let tag = if self.inside { CLOSE_TAG } else { OPEN_TAG };
            match self.pending.find(tag) {
                Some(pos) => {
                    if !self.inside {
                        out.push_str(&self.pending[..pos]);
                    }
                    self.pending.drain(..pos + tag.len());
                    self.inside = !self.inside;
                }
                None => {
                    let cut = self.pending.len() - held_suffix_len(&self.pending, tag);
                    if !self.inside {
                        out.push_str(&self.pending[..cut]);
                    }
                    self.pending.drain(..cut);
                    return out;
                }
            }
        }
    }

    /// Flush at end of stream. An unterminated block is dropped.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if self.inside {
            String::new()
        } else {
            rest
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn held_suffix_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&n| {
            n <= text.len() && text.is_char_boundary(text.len() - n) && text.ends_with(&marker[..n])
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_filter(deltas: &[&str]) -> (String, bool) {
        let mut filter = SentinelFilter::new();
        let mut out = String::new();
        let mut seen = false;
        for d in deltas {
            let (visible, hit) = filter.push(d);
            out.push_str(&visible);
            seen |= hit;
        }
        out.push_str(&filter.finish());
        (out, seen)
    }

    #[test]
    fn test_parse_tool_blocks() {
        let text = "Let me check.\n<tool_call>\n{\"name\": \"read_file\", \"arguments\": {\"path\": \"notes.md\"}}\n</tool_call>";
        let (calls, stripped) = parse_tool_blocks(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, json!({"path": "notes.md"}));
        assert_eq!(stripped, "Let me check.");
    }

    #[test]
    fn test_bad_blocks_degrade() {
        let text = "<tool_call>{oops}</tool_call><tool_call>{\"name\":\"list_files\",\"arguments\":\"nope\"}</tool_call>";
        let (calls, stripped) = parse_tool_blocks(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({}));
        assert!(stripped.is_empty());
    }

    #[test]
    fn test_string_encoded_arguments() {
        let text = r#"<tool_call>{"name":"read_file","arguments":"{\"path\":\"a.md\"}"}</tool_call>"#;
        let (calls, _) = parse_tool_blocks(text);
        assert_eq!(calls[0].arguments, json!({"path": "a.md"}));
    }

    #[test]
    fn test_call_block_round_trips() {
        let mut call = ToolCall::pending("c0", "read_file");
        call.args = json!({"path": "notes.md"});
        let (calls, _) = parse_tool_blocks(&render_call_block(&call));
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, call.args);
    }

    #[test]
    fn test_sentinel_split_across_deltas() {
        let (out, seen) = run_filter(&["The answer is 4. [TASK", "_COMP", "LETE] trailing"]);
        assert!(seen);
        assert_eq!(out, "The answer is 4. ");
    }

    #[test]
    fn test_near_miss_is_released() {
        let (out, seen) = run_filter(&["see [TASK", " list]"]);
        assert!(!seen);
        assert_eq!(out, "see [TASK list]");
    }

    #[test]
    fn test_held_prefix_flushed_at_end() {
        let mut filter = SentinelFilter::new();
        assert_eq!(filter.push("done [TA"), ("done ".to_string(), false));
        assert_eq!(filter.finish(), "[TA");
    }

    #[test]
    fn test_multibyte_text_passes() {
        let (out, seen) = run_filter(&["héllo ", "wörld"]);
        assert!(!seen);
        assert_eq!(out, "héllo wörld");
    }

    #[test]
    fn test_block_filter_hides_split_blocks() {
        let mut filter = ToolBlockFilter::new();
        let mut out = String::new();
        for d in ["Checking.\n<tool", "_call>{\"name\":", "\"read_file\"}</tool_c", "all>Done", " <b>ok</b>"] {
            out.push_str(&filter.push(d));
        }
        out.push_str(&filter.finish());
        assert_eq!(out, "Checking.\nDone <b>ok</b>");
    }

    #[test]
    fn test_block_filter_drops_unterminated_block() {
        let mut filter = ToolBlockFilter::new();
        assert_eq!(filter.push("a<tool_call>{\"na"), "a");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn test_strip_sentinel() {
        assert_eq!(strip_sentinel("ok [TASK_COMPLETE]"), "ok ");
    }
}
