//! Filesystem scanner: walks a workspace root and emits candidate
//! file entries with an excluded flag, honoring `.sariignore`/`.gitignore`
//! and the resolved config's include/exclude rules.

use crate::config::ResolvedConfig;
use ignore::WalkBuilder;
use rayon::prelude::*;
use regex::RegexSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct CandidateEntry {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub mtime: i64,
    pub size: i64,
    pub excluded: bool,
}

/// Compiled exclude rules: directory names and filename globs, built once at
/// scanner construction for O(1) per-entry dispatch.
pub struct Scanner {
    root: PathBuf,
    extensions: std::collections::BTreeSet<String>,
    exclude_dirs: RegexSet,
}

impl Scanner {
    pub fn new(config: &ResolvedConfig) -> Self {
        let dir_patterns: Vec<String> = config
            .final_exclude_dirs
            .iter()
            .map(|d| format!("(^|/){}(/|$)", regex::escape(d)))
            .collect();
        let exclude_dirs = RegexSet::new(&dir_patterns).unwrap_or_else(|_| RegexSet::empty());
        Scanner {
            root: config.workspace_root.clone(),
            extensions: config.final_extensions.clone(),
            exclude_dirs,
        }
    }

    fn is_excluded(&self, rel_path: &str) -> bool {
        self.exclude_dirs.is_match(rel_path)
    }

    fn is_included_extension(&self, rel_path: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match std::path::Path::new(rel_path).extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.contains(ext),
            None => false,
        }
    }

    /// Walks the workspace root in parallel (depth-first per worker,
    /// bounded by [`MAX_DEPTH`]), respecting `.gitignore`/`.sariignore` via
    /// the `ignore` crate's builder, and returns every candidate entry —
    /// including excluded ones, which carry only path/mtime/size so that
    /// deletions of previously-indexed-but-now-excluded files can still be
    /// tombstoned.
    pub fn walk(&self) -> Vec<CandidateEntry> {
        let max_depth = std::env::var("SARI_MAX_DEPTH").ok().and_then(|v| v.parse().ok()).unwrap_or(MAX_DEPTH);
        let follow_symlinks = matches!(
            std::env::var("SARI_FOLLOW_SYMLINKS").ok().as_deref(),
            Some("1") | Some("true") | Some("yes")
        );
        let results = Mutex::new(Vec::new());
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .max_depth(Some(max_depth))
            .follow_links(follow_symlinks)
            .add_custom_ignore_filename(".sariignore")
            .hidden(false);

        let walker = builder.build_parallel();
        walker.run(|| {
            let root = self.root.clone();
            Box::new(|entry| {
                if let Ok(entry) = entry {
                    if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        let abs_path = entry.path().to_path_buf();
                        let rel_path = abs_path
                            .strip_prefix(&root)
                            .unwrap_or(&abs_path)
                            .to_string_lossy()
                            .replace('\\', "/");
                        let meta = entry.metadata().ok();
                        let mtime = meta
                            .as_ref()
                            .and_then(|m| m.modified().ok())
                            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0);
                        let size = meta.as_ref().map(|m| m.len() as i64).unwrap_or(0);
                        let excluded = self.is_excluded(&rel_path) || !self.is_included_extension(&rel_path);
                        results.lock().unwrap().push(CandidateEntry {
                            abs_path,
                            rel_path,
                            mtime,
                            size,
                            excluded,
                        });
                    }
                }
                ignore::WalkState::Continue
            })
        });

        let mut entries = results.into_inner().unwrap();
        entries.par_sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn walk_finds_files_and_flags_excluded() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), b"fn main() {}").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules").join("x.js"), b"1").unwrap();

        let config = crate::config::resolve_final_config(dir.path()).unwrap();
        let scanner = Scanner::new(&config);
        let entries = scanner.walk();

        let main_entry = entries.iter().find(|e| e.rel_path == "main.rs").unwrap();
        assert!(!main_entry.excluded);

        let nm_entry = entries.iter().find(|e| e.rel_path.contains("node_modules"));
        if let Some(nm) = nm_entry {
            assert!(nm.excluded);
        }
    }
}
