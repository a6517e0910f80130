//! Keyword search over the notes folder

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tracing::debug;
use crate::Result;
use crate::config::ProviderConfig;
use super::knowledge::{KnowledgeSearch, SearchHit, SearchResults};

/// Characters of context kept around the first match.
const SNIPPET_RADIUS: usize = 160;

/// Scores markdown notes by how often the query terms occur.
///
/// A small stand-in for a real index, good enough for a local notes folder.
pub struct VaultSearch {
    root: PathBuf,
}

impl VaultSearch {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn collect_notes(&self, dir: &Path, notes: &mut Vec<PathBuf>) -> std::io::Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                // Skip hidden directories like .git, .obsidian
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with('.') {
                        continue;
                    }
                }
                self.collect_notes(&path, notes)?;
            } else if is_note(&path) {
                notes.push(path);
            }
        }
        Ok(())
    }

    /// Relative paths of every note, sorted.
    pub fn list_notes(&self) -> std::io::Result<Vec<String>> {
        let mut notes = Vec::new();
        self.collect_notes(&self.root, &mut notes)?;
        let mut names: Vec<String> = notes.iter().map(|p| self.relative(p)).collect();
        names.sort();
        Ok(names)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn score(&self, path: &Path, terms: &[String]) -> Option<SearchHit> {
        let content = std::fs::read_to_string(path).ok()?;
        let lower = content.to_lowercase();
        let relative = self.relative(path);
        let lower_path = relative.to_lowercase();

        let mut score = 0.0f32;
        for term in terms {
            score += lower.matches(term.as_str()).count() as f32;
            // A hit in the file name counts for more than one in the body.
            if lower_path.contains(term.as_str()) {
                score += 3.0;
            }
        }
        if score == 0.0 {
            return None;
        }

        let title = content
            .lines()
            .find_map(|l| l.strip_prefix("# "))
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| {
                Path::new(&relative)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| relative.clone())
            });

        Some(SearchHit {
            snippet: snippet(&content, &lower, terms),
            path: relative,
            title,
            score,
        })
    }
}

fn is_note(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("markdown") | Some("txt")
    )
}

/// Text around the first matching term, on char boundaries.
fn snippet(content: &str, lower: &str, terms: &[String]) -> String {
    let first = terms.iter().filter_map(|t| lower.find(t.as_str())).min().unwrap_or(0);
    // Lowercasing can shift byte offsets; map back through char counts.
    let char_pos = lower[..first].chars().count();
    let start = char_pos.saturating_sub(SNIPPET_RADIUS / 2);
    let text: String = content
        .chars()
        .skip(start)
        .take(SNIPPET_RADIUS)
        .collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl KnowledgeSearch for VaultSearch {
    async fn search_with_results(
        &self,
        query: &str,
        _config: &ProviderConfig,
        max_results: usize,
    ) -> Result<SearchResults> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|t| t.chars().count() > 1)
            .collect();
        if terms.is_empty() {
            return Ok(SearchResults::default());
        }

        let mut notes = Vec::new();
        self.collect_notes(&self.root, &mut notes)?;

        let mut results: Vec<SearchHit> = notes
            .iter()
            .filter_map(|p| self.score(p, &terms))
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        results.truncate(max_results);
        debug!("Vault search '{}': {} hits", query, results.len());

        let context = results
            .iter()
            .enumerate()
            .map(|(i, h)| format!("[{}] {} ({}): {}", i + 1, h.title, h.path, h.snippet))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(SearchResults { results, context })
    }
}
