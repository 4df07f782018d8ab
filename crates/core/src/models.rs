//! Data model: the on-disk and in-flight record shapes shared by the
//! worker pipeline, storage pipeline, and search engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Zlib-compressed content blobs are prefixed with this magic tag so a
/// reader can tell compressed content from raw bytes without a side
/// channel.
pub const ZLIB_MAGIC: &[u8] = b"ZLIB\0";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Root {
    pub root_id: String,
    pub abs_path: String,
    pub real_path: String,
    pub label: String,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// A single file row. Identity is the composite key `(root_id, rel_path)`,
/// materialized as `db_path` for storage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub root_id: String,
    pub rel_path: String,
    pub repo: String,
    pub mtime: i64,
    pub size: i64,
    /// Raw bytes, optionally zlib-compressed with [`ZLIB_MAGIC`] prefix.
    pub content: Option<Vec<u8>>,
    pub content_hash: String,
    pub fts_content: String,
    pub scan_ts: i64,
    pub deleted_ts: i64,
    pub parse_status: String,
    pub parse_reason: String,
    pub ast_status: String,
    pub ast_reason: String,
    pub is_binary: bool,
    pub is_minified: bool,
    pub content_bytes: i64,
    pub metadata_json: String,
}

impl FileRecord {
    pub fn db_path(&self) -> String {
        format!("{}/{}", self.root_id, self.rel_path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Interface,
    Variable,
    Resource,
    Block,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Interface => "interface",
            SymbolKind::Variable => "variable",
            SymbolKind::Resource => "resource",
            SymbolKind::Block => "block",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol_id: String,
    pub root_id: String,
    pub path: String,
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub parent_qualname: String,
    pub qualname: String,
    pub docstring: String,
    pub importance: f64,
    pub metadata_json: String,
}

impl Symbol {
    /// `symbol_id = H(path, kind, qualname)`, a stable 160-bit digest.
    pub fn compute_id(path: &str, kind: SymbolKind, qualname: &str) -> String {
        let material = format!("{path}\u{0}{}\u{0}{qualname}", kind.as_str());
        crate::workspace::stable_digest(material.as_bytes())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    Calls,
    Implements,
    Extends,
    Overrides,
    Imports,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Calls => "calls",
            RelationKind::Implements => "implements",
            RelationKind::Extends => "extends",
            RelationKind::Overrides => "overrides",
            RelationKind::Imports => "imports",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relation {
    pub from_root_id: String,
    pub from_path: String,
    pub from_symbol: String,
    pub from_symbol_id: String,
    pub to_root_id: String,
    pub to_path: String,
    pub to_symbol: String,
    pub to_symbol_id: String,
    pub kind: RelationKind,
    pub call_site_line: u32,
    pub metadata_json: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snippet {
    pub id: Option<i64>,
    pub tag: String,
    pub root_id: String,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub content_hash: String,
    pub anchor_before: String,
    pub anchor_after: String,
    pub repo: String,
    pub note: String,
    pub commit_hash: String,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub metadata_json: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: Option<i64>,
    pub topic: String,
    pub content: String,
    pub tags: Vec<String>,
    pub related_files: Vec<String>,
    pub source: String,
    pub valid_from: i64,
    pub valid_until: i64,
    pub deprecated: bool,
    pub created_ts: i64,
    pub updated_ts: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedTask {
    pub path: String,
    pub root_id: String,
    pub attempts: u32,
    pub error: String,
    pub timestamp: i64,
    pub next_retry: i64,
    pub metadata_json: String,
}

/// In-memory L2 projection of a recently written file.
#[derive(Clone, Debug)]
pub struct OverlayRow {
    pub db_path: String,
    pub root_id: String,
    pub repo: String,
    pub mtime: i64,
    pub size: i64,
    pub path: String,
    /// Normalized (NFKC-ish fold + whitespace collapse) snippet excerpt used
    /// for in-memory substring matching.
    pub snippet_norm: String,
}

/// The full per-file result produced by the worker pipeline, carrying the
/// 20-field row plus symbols/relations — mirrors the original
/// `IndexingResult` 1:1 so field order on `to_file_row` matches the `files`
/// table schema exactly.
#[derive(Clone, Debug)]
pub struct IndexingResult {
    pub kind: IndexingResultKind,
    pub file: FileRecord,
    pub symbols: Vec<Symbol>,
    pub relations: Vec<Relation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexingResultKind {
    Unchanged,
    Changed,
    New,
    Deleted,
    Skipped,
}

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub query: String,
    pub limit: usize,
    pub root_ids: Option<Vec<String>>,
    pub use_regex: bool,
    pub include_content: bool,
    pub repo: Option<String>,
    pub snippet_lines: usize,
    pub total_mode: String,
    pub file_types: Vec<String>,
    pub path_pattern: Option<String>,
    pub case_sensitive: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: 50,
            root_ids: None,
            use_regex: false,
            include_content: false,
            repo: None,
            snippet_lines: 3,
            total_mode: "exact".to_string(),
            file_types: Vec::new(),
            path_pattern: None,
            case_sensitive: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchHit {
    pub repo: String,
    pub path: String,
    pub score: f64,
    pub snippet: String,
    pub mtime: i64,
    pub size: i64,
    pub match_count: u32,
    pub file_type: String,
    pub hit_reason: String,
    pub scope_reason: String,
    pub context_symbol: String,
    pub docstring: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchMeta {
    pub engine: String,
    pub partial: bool,
    pub db_health: String,
    pub db_error: Option<String>,
    pub total: usize,
    pub total_mode: String,
}

#[derive(Clone, Debug)]
pub enum TaskPayload {
    ScanFile { root_id: String, path: String },
    UpsertFiles(Vec<FileRecord>),
    UpsertSymbols(Vec<Symbol>),
    UpsertRelations(Vec<Relation>),
    UpdateLastSeen { root_id: String, paths: Vec<String>, scan_ts: i64 },
    DeletePath { root_id: String, path: String },
    UpsertSnippets(Vec<Snippet>),
    UpsertContexts(Vec<ContextEntry>),
    DlqUpsert(FailedTask),
    DlqClear { root_id: String, path: String },
}

#[derive(Clone, Debug)]
pub struct TaskQueueItem {
    pub payload: TaskPayload,
    pub enqueued_ts: i64,
}
