//! Size estimation and budget truncation.
//!
//! Vendors advertise their context limits in characters here rather than
//! tokens; ~4 characters per token is used wherever a token figure is logged.

use tracing::debug;

/// Characters per token estimate (conservative across vendors).
const CHARS_PER_TOKEN: usize = 4;

/// Estimate token count for a string.
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Cap `text` at `max_chars`, appending an explicit truncation marker when cut.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    let kept = truncate_chars(text, max_chars);
    if kept.len() == text.len() {
        return text.to_string();
    }
    let dropped = text[kept.len()..].chars().count();
    debug!("Truncated {} of {} chars", dropped, dropped + max_chars);
    format!("{}\n[... truncated {} characters]", kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("Hi"), 1);
        assert_eq!(estimate_tokens("Hello"), 2);
        assert_eq!(estimate_tokens("Hello, world!"), 4);
    }

    #[test]
    fn test_truncate_chars_respects_utf8() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("日本語", 1), "日");
    }

    #[test]
    fn test_truncate_with_marker() {
        assert_eq!(truncate_with_marker("short", 10), "short");

        let out = truncate_with_marker("abcdefghij", 4);
        assert_eq!(out, "abcd\n[... truncated 6 characters]");
    }
}
