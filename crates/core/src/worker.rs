//! Worker pipeline: classify, hash, parse, and produce per-file
//! result records. Workers never hold a database handle; they hand results
//! to the storage pipeline.

use crate::models::{FileRecord, IndexingResult, IndexingResultKind, ZLIB_MAGIC};
use crate::parser::ParserRegistry;
use crate::scan::CandidateEntry;
use crate::workspace::find_git_toplevel;
use std::path::Path;

pub const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_AST_BYTES: usize = 512 * 1024;

/// Default zlib compression level, matching `zlib.compress`'s own default.
pub const DEFAULT_COMPRESS_LEVEL: u32 = 6;

#[derive(Clone, Copy)]
pub struct WorkerConfig {
    pub max_parse_bytes: usize,
    pub max_ast_bytes: usize,
    pub store_content: bool,
    pub compress: bool,
    pub compress_level: u32,
    pub redact_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_parse_bytes: MAX_PARSE_BYTES,
            max_ast_bytes: MAX_AST_BYTES,
            store_content: true,
            compress: false,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            redact_enabled: false,
        }
    }
}

impl WorkerConfig {
    /// Builds a config from `SARI_MAX_PARSE_BYTES`, `SARI_MAX_AST_BYTES`,
    /// `SARI_STORE_CONTENT`, `SARI_STORE_CONTENT_COMPRESS`,
    /// `SARI_STORE_CONTENT_COMPRESS_LEVEL`, and `SARI_REDACT_ENABLED`,
    /// falling back to [`WorkerConfig::default`] for anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let default = WorkerConfig::default();
        WorkerConfig {
            max_parse_bytes: env_usize("SARI_MAX_PARSE_BYTES", default.max_parse_bytes),
            max_ast_bytes: env_usize("SARI_MAX_AST_BYTES", default.max_ast_bytes),
            store_content: env_bool("SARI_STORE_CONTENT", default.store_content),
            compress: env_bool("SARI_STORE_CONTENT_COMPRESS", default.compress),
            compress_level: env_usize("SARI_STORE_CONTENT_COMPRESS_LEVEL", default.compress_level as usize).clamp(0, 9) as u32,
            redact_enabled: env_bool("SARI_REDACT_ENABLED", default.redact_enabled),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

/// Prior state of a file row, used for the unchanged/changed decision.
#[derive(Clone, Default)]
pub struct PriorFileState {
    pub mtime: i64,
    pub size: i64,
    pub content_hash: String,
}

/// Bounded per-root cache of git-top-level lookups, so repo-label inference
/// doesn't hit the filesystem for every file. Backed by
/// `DashMap` rather than a `HashMap` behind a single `Mutex`: workers look up
/// a label for every file they process, and a root with many files spread
/// across several git checkouts would otherwise serialize the whole worker
/// pool on one lock for a cache that's read far more than it's written.
#[derive(Default)]
pub struct RepoLabelCache {
    cache: dashmap::DashMap<String, String>,
}

impl RepoLabelCache {
    pub fn label_for(&self, workspace_root: &Path, abs_dir: &Path) -> String {
        let key = abs_dir.to_string_lossy().to_string();
        if let Some(label) = self.cache.get(&key) {
            return label.clone();
        }
        let label = find_git_toplevel(abs_dir)
            .and_then(|top| top.file_name().map(|n| n.to_string_lossy().to_string()))
            .or_else(|| workspace_root.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "root".to_string());
        self.cache.insert(key, label.clone());
        label
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let sample = &bytes[..bytes.len().min(8192)];
    let null_count = sample.iter().filter(|&&b| b == 0).count();
    null_count * 100 / sample.len().max(1) > 1
}

fn looks_minified(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().take(50).collect();
    if lines.is_empty() {
        return false;
    }
    let avg_len: usize = lines.iter().map(|l| l.len()).sum::<usize>() / lines.len();
    avg_len > 500
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn redact(text: &str) -> String {
    // Strip common credential-shaped substrings before storage/FTS.
    static PATTERNS: [&str; 3] = [
        r#"(?i)(api[_-]?key|secret|token)\s*[:=]\s*["']?[A-Za-z0-9_\-]{12,}["']?"#,
        r"(?i)-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
        r"(?i)(password)\s*[:=]\s*\S+",
    ];
    let mut out = text.to_string();
    for pat in PATTERNS {
        if let Ok(re) = regex::Regex::new(pat) {
            out = re.replace_all(&out, "[REDACTED]").to_string();
        }
    }
    out
}

fn normalize_fts(text: &str) -> String {
    crate::workspace::normalize_for_match(text)
}

fn zlib_compress(bytes: &[u8], level: u32) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(ZLIB_MAGIC.len() + bytes.len() / 2), Compression::new(level));
    let deflated = match encoder.write_all(bytes) {
        Ok(()) => encoder.finish(),
        Err(e) => Err(e),
    };
    let mut out = Vec::with_capacity(ZLIB_MAGIC.len());
    out.extend_from_slice(ZLIB_MAGIC);
    match deflated {
        Ok(body) => out.extend_from_slice(&body),
        Err(_) => out.extend_from_slice(bytes),
    }
    out
}

pub fn zlib_decompress(bytes: &[u8]) -> Vec<u8> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let Some(body) = bytes.strip_prefix(ZLIB_MAGIC) else {
        return bytes.to_vec();
    };
    let mut decoder = ZlibDecoder::new(body);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => body.to_vec(),
    }
}

/// Processes one candidate file entry end to end. Returns `None` when the
/// file vanished mid-scan (survivable).
pub fn process_file(
    workspace_root: &Path,
    root_id: &str,
    entry: &CandidateEntry,
    prior: Option<&PriorFileState>,
    scan_ts: i64,
    force: bool,
    config: &WorkerConfig,
    parsers: &ParserRegistry,
    repo_cache: &RepoLabelCache,
) -> Option<IndexingResult> {
    let meta = std::fs::metadata(&entry.abs_path).ok()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(entry.mtime);
    let size = meta.len() as i64;

    let repo = repo_cache.label_for(workspace_root, entry.abs_path.parent().unwrap_or(workspace_root));

    if entry.excluded {
        return Some(IndexingResult {
            kind: IndexingResultKind::Skipped,
            file: FileRecord {
                root_id: root_id.to_string(),
                rel_path: entry.rel_path.clone(),
                repo,
                mtime,
                size,
                content: None,
                content_hash: String::new(),
                fts_content: String::new(),
                scan_ts,
                deleted_ts: 0,
                parse_status: "skipped".to_string(),
                parse_reason: "excluded".to_string(),
                ast_status: "skipped".to_string(),
                ast_reason: "excluded".to_string(),
                is_binary: false,
                is_minified: false,
                content_bytes: 0,
                metadata_json: "{}".to_string(),
            },
            symbols: Vec::new(),
            relations: Vec::new(),
        });
    }

    if !force {
        if let Some(prior) = prior {
            if prior.mtime == mtime && prior.size == size {
                return Some(IndexingResult {
                    kind: IndexingResultKind::Unchanged,
                    file: FileRecord {
                        root_id: root_id.to_string(),
                        rel_path: entry.rel_path.clone(),
                        repo,
                        mtime,
                        size,
                        content: None,
                        content_hash: prior.content_hash.clone(),
                        fts_content: String::new(),
                        scan_ts,
                        deleted_ts: 0,
                        parse_status: "ok".to_string(),
                        parse_reason: "none".to_string(),
                        ast_status: "skipped".to_string(),
                        ast_reason: "unchanged".to_string(),
                        is_binary: false,
                        is_minified: false,
                        content_bytes: 0,
                        metadata_json: "{}".to_string(),
                    },
                    symbols: Vec::new(),
                    relations: Vec::new(),
                });
            }
        }
    }

    if size as usize > config.max_parse_bytes {
        return Some(IndexingResult {
            kind: IndexingResultKind::Changed,
            file: FileRecord {
                root_id: root_id.to_string(),
                rel_path: entry.rel_path.clone(),
                repo,
                mtime,
                size,
                content: None,
                content_hash: String::new(),
                fts_content: String::new(),
                scan_ts,
                deleted_ts: 0,
                parse_status: "skipped".to_string(),
                parse_reason: "too_large".to_string(),
                ast_status: "skipped".to_string(),
                ast_reason: "too_large".to_string(),
                is_binary: false,
                is_minified: false,
                content_bytes: 0,
                metadata_json: "{}".to_string(),
            },
            symbols: Vec::new(),
            relations: Vec::new(),
        });
    }

    let Ok(raw_bytes) = std::fs::read(&entry.abs_path) else {
        return None;
    };
    let is_binary = looks_binary(&raw_bytes);
    let content_hash = crate::workspace::stable_digest(&raw_bytes);

    if !force {
        if let Some(prior) = prior {
            if prior.mtime == mtime && prior.size == size && prior.content_hash == content_hash {
                return Some(IndexingResult {
                    kind: IndexingResultKind::Unchanged,
                    file: FileRecord {
                        root_id: root_id.to_string(),
                        rel_path: entry.rel_path.clone(),
                        repo,
                        mtime,
                        size,
                        content: None,
                        content_hash,
                        fts_content: String::new(),
                        scan_ts,
                        deleted_ts: 0,
                        parse_status: "ok".to_string(),
                        parse_reason: "none".to_string(),
                        ast_status: "skipped".to_string(),
                        ast_reason: "unchanged".to_string(),
                        is_binary,
                        is_minified: false,
                        content_bytes: 0,
                        metadata_json: "{}".to_string(),
                    },
                    symbols: Vec::new(),
                    relations: Vec::new(),
                });
            }
        }
    }

    let mut symbols = Vec::new();
    let mut relations = Vec::new();
    let mut parse_status = "ok".to_string();
    let mut parse_reason = "none".to_string();
    let mut ast_status = "skipped".to_string();
    let mut ast_reason = "binary".to_string();
    let mut fts_content = String::new();
    let mut is_minified = false;

    if !is_binary {
        let text = decode_text(&raw_bytes);
        is_minified = looks_minified(&text);
        let projected = if config.redact_enabled { redact(&text) } else { text.clone() };
        fts_content = normalize_fts(&projected);

        let ext = Path::new(&entry.rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if raw_bytes.len() > config.max_ast_bytes {
            ast_status = "skipped".to_string();
            ast_reason = "too_large_for_ast".to_string();
        } else {
            match parsers.for_extension(ext) {
                Some(parser) => {
                    let (s, r) = parser.extract(root_id, &entry.rel_path, &text);
                    symbols = s;
                    relations = r;
                    ast_status = "ok".to_string();
                    ast_reason = String::new();
                }
                None => {
                    ast_status = "skipped".to_string();
                    ast_reason = "no_parser".to_string();
                }
            }
        }
    } else {
        parse_status = "skipped".to_string();
        parse_reason = "binary".to_string();
    }

    let content = if config.store_content {
        let projected = if config.redact_enabled { redact(&decode_text(&raw_bytes)) } else { raw_bytes.clone() };
        let payload = if config.redact_enabled { projected } else { raw_bytes.clone() };
        Some(if config.compress { zlib_compress(&payload, config.compress_level) } else { payload })
    } else {
        None
    };

    Some(IndexingResult {
        kind: IndexingResultKind::Changed,
        file: FileRecord {
            root_id: root_id.to_string(),
            rel_path: entry.rel_path.clone(),
            repo,
            mtime,
            size,
            content,
            content_hash,
            fts_content,
            scan_ts,
            deleted_ts: 0,
            parse_status,
            parse_reason,
            ast_status,
            ast_reason,
            is_binary,
            is_minified,
            content_bytes: raw_bytes.len() as i64,
            metadata_json: "{}".to_string(),
        },
        symbols,
        relations,
    })
}

/// Worker thread pool sizing: `min(INDEX_WORKERS, INDEX_MEM_MB/512)`.
pub fn worker_count(index_workers: usize, index_mem_mb: usize) -> usize {
    index_workers.min((index_mem_mb / 512).max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn vanished_file_returns_none() {
        let dir = tempdir().unwrap();
        let entry = CandidateEntry {
            abs_path: dir.path().join("gone.rs"),
            rel_path: "gone.rs".to_string(),
            mtime: 0,
            size: 0,
            excluded: false,
        };
        let parsers = ParserRegistry::with_builtins();
        let cache = RepoLabelCache::default();
        let result = process_file(dir.path(), "root", &entry, None, 0, false, &WorkerConfig::default(), &parsers, &cache);
        assert!(result.is_none());
    }

    #[test]
    fn unchanged_file_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, b"fn a() {}").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let mtime = meta.modified().unwrap().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        let size = meta.len() as i64;
        let raw = std::fs::read(&path).unwrap();
        let hash = crate::workspace::stable_digest(&raw);

        let entry = CandidateEntry {
            abs_path: path,
            rel_path: "a.rs".to_string(),
            mtime,
            size,
            excluded: false,
        };
        let prior = PriorFileState { mtime, size, content_hash: hash };
        let parsers = ParserRegistry::with_builtins();
        let cache = RepoLabelCache::default();
        let result = process_file(dir.path(), "root", &entry, Some(&prior), 0, false, &WorkerConfig::default(), &parsers, &cache).unwrap();
        assert_eq!(result.kind, IndexingResultKind::Unchanged);
    }

    #[test]
    fn oversize_file_is_skipped_without_symbols() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.rs");
        std::fs::write(&path, vec![b'x'; 10]).unwrap();
        let entry = CandidateEntry {
            abs_path: path,
            rel_path: "big.rs".to_string(),
            mtime: 0,
            size: 10,
            excluded: false,
        };
        let mut config = WorkerConfig::default();
        config.max_parse_bytes = 1;
        let parsers = ParserRegistry::with_builtins();
        let cache = RepoLabelCache::default();
        let result = process_file(dir.path(), "root", &entry, None, 0, false, &config, &parsers, &cache).unwrap();
        assert_eq!(result.file.parse_reason, "too_large");
        assert!(result.symbols.is_empty());
    }

    #[test]
    fn zlib_round_trips_and_actually_shrinks() {
        let text = "needle ".repeat(500);
        let compressed = zlib_compress(text.as_bytes(), DEFAULT_COMPRESS_LEVEL);
        assert!(compressed.starts_with(ZLIB_MAGIC));
        assert!(compressed.len() < text.len());
        let restored = zlib_decompress(&compressed);
        assert_eq!(restored, text.as_bytes());
    }

    #[test]
    fn zlib_decompress_passes_through_uncompressed_bytes() {
        let raw = b"plain bytes, no magic prefix";
        assert_eq!(zlib_decompress(raw), raw);
    }

    #[test]
    fn normalize_fts_folds_and_collapses_whitespace() {
        assert_eq!(normalize_fts("  Needle   HERE  "), "needle here");
    }
}
