//! Filesystem tools - read and list notes
//!
//! Both tools are confined to the notes root: absolute paths and `..`
//! components are rejected, and symlinks leading outside are refused.

use std::path::{Component, Path, PathBuf};
use async_trait::async_trait;
use serde_json::{json, Value};
use crate::Result;
use crate::error::Error;
use super::Tool;

/// Resolve `relative` inside `root`, refusing anything that escapes it.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative.trim());
    if rel.is_absolute()
        || rel.components().any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(Error::Tool(format!("Path must stay inside the notes folder: {}", relative)));
    }
    let path = root.join(rel);

    // Symlinks can still point outside; compare canonical forms when both exist.
    if let (Ok(real_root), Ok(real_path)) = (root.canonicalize(), path.canonicalize()) {
        if !real_path.starts_with(&real_root) {
            return Err(Error::Tool(format!("Path must stay inside the notes folder: {}", relative)));
        }
    }
    Ok(path)
}

/// Read a note
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str { "read_file" }
    fn description(&self) -> &str { "Read the contents of a note, by path relative to the notes folder" }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the note, e.g. 'notes.md' or 'projects/plan.md'"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let path = params.get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Tool("Missing 'path' parameter".to_string()))?;

        let full = resolve(&self.root, path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| Error::Tool(format!("Failed to read {}: {}", path, e)))?;
        Ok(Value::String(content))
    }
}

/// List the notes folder
pub struct ListFilesTool {
    root: PathBuf,
}

impl ListFilesTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str { "list_files" }
    fn description(&self) -> &str { "List notes and folders inside the notes folder" }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Sub-folder to list (optional, defaults to the notes root)"
                }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let sub = params.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let dir = resolve(&self.root, sub)?;

        let mut entries: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|e| Error::Tool(format!("Failed to read directory {}: {}", dir.display(), e)))?
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let is_dir = e.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
                if is_dir { format!("{}/", name) } else { name }
            })
            .collect();
        entries.sort();

        if entries.is_empty() {
            return Ok(json!("(empty)"));
        }
        Ok(Value::String(entries.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "# Notes\nbuy milk").unwrap();

        let tool = ReadFileTool::new(tmp.path().to_path_buf());
        let result = tool.execute(json!({"path": "notes.md"})).await.unwrap();
        assert_eq!(result, json!("# Notes\nbuy milk"));

        let missing = tool.execute(json!({"path": "nope.md"})).await;
        assert!(matches!(missing, Err(Error::Tool(msg)) if msg.starts_with("Failed to read nope.md")));
    }

    #[tokio::test]
    async fn test_read_file_stays_in_root() {
        let tmp = TempDir::new().unwrap();
        let tool = ReadFileTool::new(tmp.path().join("vault"));
        for path in ["../secret.md", "/etc/passwd", "a/../../b.md"] {
            let result = tool.execute(json!({"path": path})).await;
            assert!(matches!(result, Err(Error::Tool(_))), "{} should be refused", path);
        }
    }

    #[tokio::test]
    async fn test_list_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.md"), "").unwrap();
        std::fs::write(tmp.path().join("a.md"), "").unwrap();
        std::fs::write(tmp.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(tmp.path().join("projects")).unwrap();

        let tool = ListFilesTool::new(tmp.path().to_path_buf());
        let result = tool.execute(json!({})).await.unwrap();
        assert_eq!(result, json!("a.md\nb.md\nprojects/"));

        let empty = tool.execute(json!({"path": "projects"})).await.unwrap();
        assert_eq!(empty, json!("(empty)"));
    }
}
