//! Missing-argument recovery.
//!
//! Models sometimes name the note in prose and then call the tool without
//! the path. A [`RecoveryRule`] fills such an argument from the most recent
//! match of its pattern in the recent conversation text.

use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::Error;
use crate::Result;

/// Relative markdown path such as `notes.md` or `projects/q3-plan.md`.
const MARKDOWN_PATH: &str = r"(?:[\w\-]+/)*[\w.\-]+\.md\b";

/// Fill `argument` of `tool` from the last `pattern` match in recent text.
#[derive(Debug, Clone)]
pub struct RecoveryRule {
    pub tool: String,
    pub argument: String,
    pub pattern: Regex,
}

impl RecoveryRule {
    pub fn new(tool: &str, argument: &str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("Invalid recovery pattern for {}: {}", tool, e)))?;
        Ok(Self {
            tool: tool.to_string(),
            argument: argument.to_string(),
            pattern,
        })
    }

    /// Substitute the argument if it is missing or empty.
    ///
    /// Returns the substituted value, or `None` when nothing changed.
    pub fn apply(&self, tool: &str, args: &mut Value, recent_text: &str) -> Option<String> {
        if tool != self.tool {
            return None;
        }
        if !args.is_object() {
            *args = Value::Object(Map::new());
        }
        let present = match args.get(&self.argument) {
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if present {
            return None;
        }

        let found = self.pattern.find_iter(recent_text).last()?.as_str().to_string();
        info!(
            "Recovered missing '{}' for {} from recent text: {}",
            self.argument, tool, found
        );
        if let Some(map) = args.as_object_mut() {
            map.insert(self.argument.clone(), Value::String(found.clone()));
        }
        Some(found)
    }
}

/// Rules for the navigation tools that take a note path.
pub fn default_rules() -> Vec<RecoveryRule> {
    ["open_note", "read_file"]
        .iter()
        .filter_map(|tool| RecoveryRule::new(tool, "path", MARKDOWN_PATH).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_rule() -> RecoveryRule {
        RecoveryRule::new("read_file", "path", MARKDOWN_PATH).unwrap()
    }

    #[test]
    fn test_fills_missing_path_with_latest_match() {
        let mut args = json!({});
        let found = read_rule().apply(
            "read_file",
            &mut args,
            "compare notes.md with the plan. Opening projects/plan-v2.md now.",
        );
        assert_eq!(found.as_deref(), Some("projects/plan-v2.md"));
        assert_eq!(args, json!({"path": "projects/plan-v2.md"}));
    }

    #[test]
    fn test_empty_string_and_null_count_as_missing() {
        for mut args in [json!({"path": ""}), json!({"path": null}), json!("junk")] {
            read_rule().apply("read_file", &mut args, "read notes.md");
            assert_eq!(args["path"], "notes.md");
        }
    }

    #[test]
    fn test_present_argument_untouched() {
        let mut args = json!({"path": "a.md"});
        assert!(read_rule().apply("read_file", &mut args, "b.md").is_none());
        assert_eq!(args["path"], "a.md");
    }

    #[test]
    fn test_other_tool_or_no_match() {
        let mut args = json!({});
        assert!(read_rule().apply("list_files", &mut args, "notes.md").is_none());
        assert!(read_rule().apply("read_file", &mut args, "no paths here").is_none());
        assert_eq!(args, json!({}));
    }

    #[test]
    fn test_default_rules() {
        let rules = default_rules();
        let tools: Vec<&str> = rules.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, vec!["open_note", "read_file"]);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            RecoveryRule::new("read_file", "path", "(unclosed"),
            Err(Error::Config(_))
        ));
    }
}
