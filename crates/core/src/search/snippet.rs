//! Sliding-window snippet extraction.

use std::collections::HashMap;
use std::sync::Mutex;

pub const SNIPPET_CACHE_SIZE: usize = 2048;
/// Default cap on how many leading bytes of a file's content are scanned
/// for a snippet window; overridable via `SARI_SNIPPET_MAX_BYTES` so a
/// handful of huge files can't stall every `search` call behind one
/// line-by-line scoring pass.
pub const SNIPPET_MAX_BYTES: usize = 256 * 1024;

static DEFINITION_PATTERNS: [&str; 6] = ["class ", "def ", "function ", "struct ", "interface ", "type "];

struct CacheEntry {
    snippet: String,
    order: u64,
}

/// LRU keyed by `(path, query, content digest, case_sensitive)`.
pub struct SnippetCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    clock: u64,
}

impl SnippetCache {
    pub fn new(capacity: usize) -> Self {
        SnippetCache { inner: Mutex::new(CacheInner { map: HashMap::new(), clock: 0 }), capacity }
    }

    fn key(path: &str, query: &str, content: &str, case_sensitive: bool) -> String {
        let digest = content_digest8(content);
        format!("{path}\u{0}{query}\u{0}{digest}\u{0}{case_sensitive}")
    }

    pub fn get_or_compute(&self, path: &str, query: &str, content: &str, max_lines: usize, case_sensitive: bool) -> String {
        let key = Self::key(path, query, content, case_sensitive);
        {
            let inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.map.get(&key) {
                return entry.snippet.clone();
            }
        }
        let max_bytes = std::env::var("SARI_SNIPPET_MAX_BYTES").ok().and_then(|v| v.parse().ok()).unwrap_or(SNIPPET_MAX_BYTES);
        let truncated = truncate_at_char_boundary(content, max_bytes);
        let snippet = extract_snippet(truncated, query, max_lines, case_sensitive);
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let order = inner.clock;
        inner.map.insert(key, CacheEntry { snippet: snippet.clone(), order });
        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner.map.iter().min_by_key(|(_, e)| e.order).map(|(k, _)| k.clone()) {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
        snippet
    }
}

/// Truncated blake3 digest used only to invalidate the snippet cache on
/// content change; not a security primitive.
fn content_digest8(content: &str) -> String {
    let full = crate::workspace::stable_digest(content.as_bytes());
    full.chars().take(16).collect()
}

fn truncate_at_char_boundary(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = max_bytes;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

fn is_definition_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    DEFINITION_PATTERNS.iter().any(|p| trimmed.starts_with(p))
}

fn term_occurrences(line: &str, terms: &[String], case_sensitive: bool) -> usize {
    let haystack = if case_sensitive { line.to_string() } else { line.to_lowercase() };
    terms.iter().map(|t| haystack.matches(t.as_str()).count()).sum()
}

/// Extracts up to `max_lines` adjacent lines maximizing a weighted hit
/// score, then highlights matched terms with `>>>...<<<`.
pub fn extract_snippet(content: &str, query: &str, max_lines: usize, case_sensitive: bool) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| if case_sensitive { t.to_string() } else { t.to_lowercase() })
        .filter(|t| !t.is_empty())
        .collect();
    if terms.is_empty() {
        let window = lines.len().min(max_lines);
        return lines[..window].join("\n");
    }

    let line_scores: Vec<i64> = lines
        .iter()
        .map(|l| {
            let mut score = term_occurrences(l, &terms, case_sensitive) as i64;
            if is_definition_line(l) {
                score += 5;
            }
            score
        })
        .collect();

    let window = lines.len().min(max_lines.max(1));
    let mut best_start = 0usize;
    let mut running: i64 = line_scores[..window].iter().sum();
    let mut best_score = running;
    for start in 1..=lines.len().saturating_sub(window) {
        running += line_scores[start + window - 1];
        running -= line_scores[start - 1];
        if running > best_score {
            best_score = running;
            best_start = start;
        }
    }

    let selected = &lines[best_start..best_start + window];
    let highlighted: Vec<String> = selected.iter().map(|l| highlight_line(l, &terms, case_sensitive)).collect();
    highlighted.join("\n")
}

fn highlight_line(line: &str, terms: &[String], case_sensitive: bool) -> String {
    let haystack = if case_sensitive { line.to_string() } else { line.to_lowercase() };
    let mut marks = vec![false; line.len()];
    for term in terms {
        if term.is_empty() {
            continue;
        }
        let mut start = 0;
        while let Some(pos) = haystack[start..].find(term.as_str()) {
            let abs = start + pos;
            for i in abs..(abs + term.len()).min(marks.len()) {
                marks[i] = true;
            }
            start = abs + term.len().max(1);
            if start >= haystack.len() {
                break;
            }
        }
    }
    let mut out = String::with_capacity(line.len() + 8);
    let mut in_mark = false;
    for (i, ch) in line.char_indices() {
        let marked = marks.get(i).copied().unwrap_or(false);
        if marked && !in_mark {
            out.push_str(">>>");
            in_mark = true;
        } else if !marked && in_mark {
            out.push_str("<<<");
            in_mark = false;
        }
        out.push(ch);
    }
    if in_mark {
        out.push_str("<<<");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_window_with_most_hits() {
        let content = "line one\nline two needle\nline three needle needle\nline four";
        let snippet = extract_snippet(content, "needle", 2, false);
        assert!(snippet.contains("line three"));
    }

    #[test]
    fn highlights_matched_terms() {
        let snippet = extract_snippet("fn needle_fn() {}", "needle", 1, false);
        assert!(snippet.contains(">>>needle<<<"));
    }

    #[test]
    fn definition_lines_get_bonus() {
        let content = "struct Foo {}\nrandom text here\nrandom text here";
        let snippet = extract_snippet(content, "random", 1, false);
        assert!(snippet.contains("random text here"));
    }

    #[test]
    fn cache_returns_same_value_for_same_key() {
        let cache = SnippetCache::new(4);
        let a = cache.get_or_compute("p", "needle", "x needle y", 3, false);
        let b = cache.get_or_compute("p", "needle", "x needle y", 3, false);
        assert_eq!(a, b);
    }
}
