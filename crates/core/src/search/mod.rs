//! Query pipeline: merges the L2 overlay, the embedded engine, and
//! the SQL fallback into one ranked result set.

pub mod engine;
pub mod snippet;

use crate::models::{SearchHit, SearchMeta, SearchOptions};
use crate::storage::db;
use crate::storage::overlay::Overlay;
use engine::SearchEngineHandle;
use rusqlite::Connection;
use snippet::SnippetCache;
use std::collections::HashMap;
use std::sync::Arc;

pub struct SearchPipeline {
    overlay: Arc<Overlay>,
    engine: Option<Arc<dyn SearchEngineHandle>>,
    snippet_cache: SnippetCache,
}

impl SearchPipeline {
    pub fn new(overlay: Arc<Overlay>, engine: Option<Arc<dyn SearchEngineHandle>>) -> Self {
        let cache_size = std::env::var("SARI_SNIPPET_CACHE_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(snippet::SNIPPET_CACHE_SIZE);
        SearchPipeline { overlay, engine, snippet_cache: SnippetCache::new(cache_size) }
    }

    /// Runs the full query pipeline against a readonly SQL connection for
    /// the fallback and tombstone/filter pass. `content_loader` fetches a
    /// file's text for snippet extraction by db path. `conn` is `None` when
    /// the durable store is unreachable; the pipeline then serves an
    /// overlay-only result set with degraded meta instead of failing.
    pub fn search(
        &self,
        conn: Option<&Connection>,
        opts: &SearchOptions,
        content_loader: impl Fn(&str) -> Option<String>,
    ) -> (Vec<SearchHit>, SearchMeta) {
        let root_ids = opts.root_ids.clone().filter(|v| !v.is_empty());
        let needle_norm = if opts.case_sensitive { opts.query.clone() } else { opts.query.to_lowercase() };

        let mut merged: HashMap<String, Candidate> = HashMap::new();

        for row in self.overlay.search_substring(&needle_norm, root_ids.as_deref()) {
            merged.insert(
                row.db_path.clone(),
                Candidate { path: row.db_path, repo: row.repo, mtime: row.mtime, size: row.size, score: 100.0, from: "l2" },
            );
        }

        let mut engine_used = false;
        let mut engine_available = self.engine.is_some();
        if !opts.use_regex {
            if let Some(engine) = &self.engine {
                engine_used = true;
                match engine.search(&opts.query, root_ids.as_deref(), opts.limit.max(1) * 4) {
                    Ok(hits) => {
                        let max_score = hits.iter().map(|h| h.score).fold(0.0_f64, f64::max).max(1e-9);
                        for hit in hits {
                            let normalized = (hit.score / max_score) * 10.0;
                            merged.entry(hit.path.clone()).or_insert_with(|| Candidate {
                                path: hit.path,
                                repo: String::new(),
                                mtime: 0,
                                size: 0,
                                score: normalized,
                                from: "engine",
                            });
                        }
                    }
                    Err(_) => engine_available = false,
                }
            }
        }

        let mut db_health = "ok".to_string();
        let mut db_error = None;
        let mut partial = false;

        match conn {
            None => {
                db_health = "error".to_string();
                db_error = Some("durable store unavailable".to_string());
                partial = true;
            }
            Some(conn) if merged.len() < opts.limit || !engine_available => {
                match db::search_like(conn, &opts.query, root_ids.as_deref(), opts.limit * 4) {
                    Ok(rows) => {
                        for row in rows {
                            if row.deleted_ts > 0 {
                                continue;
                            }
                            let db_path = row.db_path();
                            if !opts.file_types.is_empty() {
                                let ext = db_path.rsplit('.').next().unwrap_or("");
                                if !opts.file_types.iter().any(|t| t == ext) {
                                    continue;
                                }
                            }
                            if let Some(pattern) = &opts.path_pattern {
                                if !db_path.contains(pattern.as_str()) {
                                    continue;
                                }
                            }
                            merged.entry(db_path.clone()).or_insert_with(|| Candidate {
                                path: db_path,
                                repo: row.repo,
                                mtime: row.mtime,
                                size: row.size,
                                score: 1.0,
                                from: "sqlite",
                            });
                        }
                    }
                    Err(e) => {
                        db_health = "error".to_string();
                        db_error = Some(e.sanitized_message());
                        partial = true;
                    }
                }
            }
            Some(_) => {}
        }

        let prefixes: Vec<String> = root_ids.clone().unwrap_or_default();
        let mut candidates: Vec<Candidate> = merged.into_values().collect();
        for c in candidates.iter_mut() {
            if prefixes.iter().any(|p| c.path.starts_with(p.as_str())) {
                c.score += 50.0;
            }
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(b.mtime.cmp(&a.mtime)));
        candidates.truncate(opts.limit);

        let total = candidates.len();
        let engine_name = if partial {
            "l2"
        } else if engine_used {
            "hybrid"
        } else {
            "sqlite"
        };

        let db_health_for_reason = db_health.clone();
        let hits: Vec<SearchHit> = candidates
            .into_iter()
            .map(|c| {
                let content = content_loader(&c.path).unwrap_or_default();
                let snippet = self.snippet_cache.get_or_compute(&c.path, &opts.query, &content, opts.snippet_lines, opts.case_sensitive);
                SearchHit {
                    repo: c.repo,
                    path: c.path,
                    score: c.score,
                    snippet,
                    mtime: c.mtime,
                    size: c.size,
                    match_count: 0,
                    file_type: String::new(),
                    hit_reason: hit_reason(c.from, &db_health_for_reason),
                    scope_reason: scope_reason(opts),
                    context_symbol: String::new(),
                    docstring: String::new(),
                    metadata: HashMap::new(),
                }
            })
            .collect();

        (
            hits,
            SearchMeta {
                engine: engine_name.to_string(),
                partial,
                db_health,
                db_error,
                total,
                total_mode: opts.total_mode.clone(),
            },
        )
    }
}

struct Candidate {
    path: String,
    repo: String,
    mtime: i64,
    size: i64,
    score: f64,
    from: &'static str,
}

fn hit_reason(from: &str, db_health: &str) -> String {
    match from {
        "l2" if db_health == "error" => "L2 Cache (Degraded)".to_string(),
        "l2" => "L2 Cache (Recent)".to_string(),
        "engine" => "Tantivy Search".to_string(),
        _ => "SQLite Fallback".to_string(),
    }
}

fn scope_reason(opts: &SearchOptions) -> String {
    let mut parts = Vec::new();
    if let Some(ids) = &opts.root_ids {
        if !ids.is_empty() {
            parts.push(format!("roots={}", ids.join(",")));
        }
    }
    if let Some(repo) = &opts.repo {
        parts.push(format!("repo={repo}"));
    }
    if !opts.file_types.is_empty() {
        parts.push(format!("file_types={}", opts.file_types.join(",")));
    }
    if let Some(pattern) = &opts.path_pattern {
        parts.push(format!("path_pattern={pattern}"));
    }
    if parts.is_empty() {
        "workspace".to_string()
    } else {
        parts.join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileRecord;
    use tempfile::tempdir;

    #[test]
    fn overlay_hit_wins_over_sql_fallback() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        let conn = db::open(&db_path).unwrap();
        db::ensure_root(&conn, "r1", "/tmp/r1", "r1", 0).unwrap();
        let file = FileRecord {
            root_id: "r1".to_string(),
            rel_path: "a.rs".to_string(),
            repo: "repo".to_string(),
            mtime: 5,
            size: 1,
            content: None,
            content_hash: "h".to_string(),
            fts_content: "needle here".to_string(),
            scan_ts: 1,
            deleted_ts: 0,
            parse_status: "ok".to_string(),
            parse_reason: "none".to_string(),
            ast_status: "ok".to_string(),
            ast_reason: String::new(),
            is_binary: false,
            is_minified: false,
            content_bytes: 1,
            metadata_json: "{}".to_string(),
        };
        db::upsert_file(&conn, &file).unwrap();

        let overlay = Arc::new(Overlay::new(10));
        overlay.upsert(crate::models::OverlayRow {
            db_path: "r1/a.rs".to_string(),
            root_id: "r1".to_string(),
            repo: "repo".to_string(),
            mtime: 5,
            size: 1,
            path: "r1/a.rs".to_string(),
            snippet_norm: "needle here".to_string(),
        });

        let pipeline = SearchPipeline::new(overlay, None);
        let opts = SearchOptions { query: "needle".to_string(), limit: 10, ..SearchOptions::default() };
        let (hits, meta) = pipeline.search(Some(&conn), &opts, |_| Some("needle here".to_string()));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 100.0);
        assert_eq!(hits[0].hit_reason, "L2 Cache (Recent)");
        assert_eq!(meta.engine, "sqlite");
    }

    #[test]
    fn degraded_search_without_connection_returns_overlay_only() {
        let overlay = Arc::new(Overlay::new(10));
        overlay.upsert(crate::models::OverlayRow {
            db_path: "r1/a.rs".to_string(),
            root_id: "r1".to_string(),
            repo: "repo".to_string(),
            mtime: 5,
            size: 1,
            path: "r1/a.rs".to_string(),
            snippet_norm: "needle here".to_string(),
        });

        let pipeline = SearchPipeline::new(overlay, None);
        let opts = SearchOptions { query: "needle".to_string(), limit: 10, ..SearchOptions::default() };
        let (hits, meta) = pipeline.search(None, &opts, |_| Some("needle here".to_string()));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].hit_reason, "L2 Cache (Degraded)");
        assert!(meta.partial);
        assert_eq!(meta.db_health, "error");
    }

    #[test]
    fn root_prefix_boost_applies() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        let conn = db::open(&db_path).unwrap();
        db::ensure_root(&conn, "r1", "/tmp/r1", "r1", 0).unwrap();
        let file = FileRecord {
            root_id: "r1".to_string(),
            rel_path: "a.rs".to_string(),
            repo: "repo".to_string(),
            mtime: 5,
            size: 1,
            content: None,
            content_hash: "h".to_string(),
            fts_content: "needle".to_string(),
            scan_ts: 1,
            deleted_ts: 0,
            parse_status: "ok".to_string(),
            parse_reason: "none".to_string(),
            ast_status: "ok".to_string(),
            ast_reason: String::new(),
            is_binary: false,
            is_minified: false,
            content_bytes: 1,
            metadata_json: "{}".to_string(),
        };
        db::upsert_file(&conn, &file).unwrap();

        let overlay = Arc::new(Overlay::new(10));
        let pipeline = SearchPipeline::new(overlay, None);
        let opts = SearchOptions {
            query: "needle".to_string(),
            limit: 10,
            root_ids: Some(vec!["r1".to_string()]),
            ..SearchOptions::default()
        };
        let (hits, _) = pipeline.search(Some(&conn), &opts, |_| Some("needle".to_string()));
        assert_eq!(hits[0].score, 51.0);
    }
}
