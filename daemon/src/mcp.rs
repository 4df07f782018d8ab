//! Tool dispatch: each of the RPC methods a bound session can call
//! after `initialize`. Every arm validates its arguments against the shape
//! the tool's name implies, calls into `sari-core`, and hands back a plain
//! JSON value — the session layer wraps that (or an error) in the PACK1
//! envelope, it is never built here.

use sari_core::ctxtoken::{self, KeyStore};
use sari_core::error::{Result, SariError};
use sari_core::models::{RelationKind, SearchOptions};
use sari_core::registry::SharedState;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub fn dispatch(state: &Arc<SharedState>, keys: &KeyStore, name: &str, args: &Value) -> Result<Value> {
    match name {
        "search" => search(state, args),
        "search_symbols" => search_symbols(state, args),
        "list_files" => list_files(state, args),
        "read_file" => read_file(state, args),
        "read_symbol" => read_symbol(state, args),
        "list_symbols" => list_symbols(state, args),
        "get_callers" => get_callers(state, args),
        "get_implementations" => get_implementations(state, args),
        "call_graph" => call_graph(state, args),
        "save_snippet" => save_snippet(state, keys, args),
        "get_snippet" => get_snippet(state, args),
        "archive_context" => archive_context(state, keys, args),
        "get_context" => get_context(state, args),
        "status" => status(state, args),
        "doctor" => doctor(state, args),
        "dry_run_diff" => dry_run_diff(state, args),
        "index_file" => index_file(state, args),
        "rescan" => rescan(state, args),
        other => Err(SariError::InvalidArgs(format!("unknown tool: {other}"))),
    }
}

fn obj(args: &Value) -> &Map<String, Value> {
    static EMPTY: Map<String, Value> = Map::new();
    args.as_object().unwrap_or(&EMPTY)
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    obj(args)
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SariError::InvalidArgs(format!("missing required argument: {key}")))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    obj(args).get(key).and_then(Value::as_str)
}

fn opt_usize(args: &Value, key: &str, default: usize) -> usize {
    obj(args).get(key).and_then(Value::as_u64).map(|n| n as usize).unwrap_or(default)
}

fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    obj(args).get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn open_conn(state: &Arc<SharedState>) -> Result<rusqlite::Connection> {
    sari_core::storage::db::open_readonly(&state.db_path())
}

fn db_path_for(state: &Arc<SharedState>, rel_path: &str) -> String {
    format!("{}/{rel_path}", state.root_id)
}

fn search(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let query = require_str(args, "query")?;
    let opts = SearchOptions {
        query: query.to_string(),
        limit: opt_usize(args, "limit", 50),
        root_ids: Some(vec![state.root_id.clone()]),
        use_regex: opt_bool(args, "use_regex", false),
        include_content: opt_bool(args, "include_content", false),
        repo: opt_str(args, "repo").map(str::to_string),
        snippet_lines: opt_usize(args, "snippet_lines", 3),
        total_mode: opt_str(args, "total_mode").unwrap_or("exact").to_string(),
        file_types: obj(args)
            .get("file_types")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
        path_pattern: opt_str(args, "path_pattern").map(str::to_string),
        case_sensitive: opt_bool(args, "case_sensitive", false),
    };
    let (hits, meta) = state.search(&opts)?;
    Ok(json!({ "hits": hits, "meta": meta }))
}

fn search_symbols(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let name = require_str(args, "name")?;
    let conn = open_conn(state)?;
    let symbols = sari_core::storage::db::find_symbols_by_name(&conn, &state.root_id, name)?;
    Ok(json!({ "symbols": symbols }))
}

fn list_files(state: &Arc<SharedState>, _args: &Value) -> Result<Value> {
    let conn = open_conn(state)?;
    let files = sari_core::storage::db::list_files_for_root(&conn, &state.root_id)?;
    let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
    Ok(json!({ "files": paths }))
}

fn read_file(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let rel_path = require_str(args, "path")?;
    let conn = open_conn(state)?;
    let db_path = db_path_for(state, rel_path);
    let file = sari_core::storage::db::get_file(&conn, &db_path)?
        .ok_or_else(|| SariError::InvalidArgs(format!("no indexed file at {rel_path}")))?;
    // Prefer the stored raw bytes (zlib-prefix-aware) so `read_file` round-trips
    // what was indexed; fall back to the FTS projection when content
    // storage is disabled (`SARI_STORE_CONTENT=0`).
    let content = match &file.content {
        Some(bytes) => {
            let raw = sari_core::worker::zlib_decompress(bytes);
            String::from_utf8(raw).unwrap_or_else(|_| file.fts_content.clone())
        }
        None => file.fts_content.clone(),
    };
    Ok(json!({
        "path": file.rel_path,
        "content": content,
        "mtime": file.mtime,
        "size": file.size,
        "parse_status": file.parse_status,
    }))
}

fn read_symbol(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let symbol_id = require_str(args, "symbol_id")?;
    let conn = open_conn(state)?;
    let symbol = sari_core::storage::db::get_symbol_by_id(&conn, symbol_id)?
        .ok_or_else(|| SariError::InvalidArgs(format!("no symbol with id {symbol_id}")))?;
    Ok(json!({ "symbol": symbol }))
}

fn list_symbols(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let rel_path = require_str(args, "path")?;
    let conn = open_conn(state)?;
    let db_path = db_path_for(state, rel_path);
    let symbols = sari_core::storage::db::list_symbols_for_path(&conn, &db_path)?;
    Ok(json!({ "symbols": symbols }))
}

fn get_callers(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let symbol_id = require_str(args, "symbol_id")?;
    let conn = open_conn(state)?;
    let relations = sari_core::storage::db::list_relations_to(&conn, symbol_id, Some(RelationKind::Calls))?;
    Ok(json!({ "callers": relations }))
}

fn get_implementations(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let symbol_id = require_str(args, "symbol_id")?;
    let conn = open_conn(state)?;
    let relations = sari_core::storage::db::list_relations_to(&conn, symbol_id, Some(RelationKind::Implements))?;
    Ok(json!({ "implementations": relations }))
}

/// Call graph for one symbol: one hop of callers and one hop of callees.
/// Deeper traversal is left to the client, which can re-call this tool from
/// any symbol id returned here — matching the "returns results or empty
/// with a reason" contract level for parser-quality-dependent tools.
fn call_graph(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let symbol_id = require_str(args, "symbol_id")?;
    let conn = open_conn(state)?;
    let callers = sari_core::storage::db::list_relations_to(&conn, symbol_id, None)?;
    let callees = sari_core::storage::db::list_relations_from(&conn, symbol_id)?;
    if callers.is_empty() && callees.is_empty() {
        return Ok(json!({
            "symbol_id": symbol_id,
            "callers": [],
            "callees": [],
            "reason": "no recorded relations for this symbol; parser coverage for its language may be partial",
        }));
    }
    Ok(json!({ "symbol_id": symbol_id, "callers": callers, "callees": callees }))
}

fn save_snippet(state: &Arc<SharedState>, keys: &KeyStore, args: &Value) -> Result<Value> {
    let tag = require_str(args, "tag")?;
    let rel_path = require_str(args, "path")?;
    let start_line = obj(args).get("start_line").and_then(Value::as_u64).unwrap_or(0) as u32;
    let end_line = obj(args).get("end_line").and_then(Value::as_u64).unwrap_or(0) as u32;
    let note = opt_str(args, "note").unwrap_or("").to_string();

    let conn = open_conn(state)?;
    let db_path = db_path_for(state, rel_path);
    let file = sari_core::storage::db::get_file(&conn, &db_path)?
        .ok_or_else(|| SariError::InvalidArgs(format!("no indexed file at {rel_path}")))?;
    drop(conn);

    let source = match &file.content {
        Some(bytes) => {
            let raw = sari_core::worker::zlib_decompress(bytes);
            String::from_utf8(raw).unwrap_or_else(|_| file.fts_content.clone())
        }
        None => file.fts_content.clone(),
    };
    let content: String = source
        .lines()
        .skip(start_line.saturating_sub(1) as usize)
        .take((end_line.saturating_sub(start_line) as usize) + 1)
        .collect::<Vec<_>>()
        .join("\n");
    let content_hash = sari_core::workspace::stable_digest(content.as_bytes());
    let now = now_unix();

    let snippet = sari_core::models::Snippet {
        id: None,
        tag: tag.to_string(),
        root_id: state.root_id.clone(),
        path: rel_path.to_string(),
        start_line,
        end_line,
        content,
        content_hash,
        anchor_before: String::new(),
        anchor_after: String::new(),
        repo: file.repo.clone(),
        note,
        commit_hash: String::new(),
        created_ts: now,
        updated_ts: now,
        metadata_json: "{}".to_string(),
    };

    let conn = sari_core::storage::db::open(&state.db_path())?;
    sari_core::storage::db::upsert_snippet(&conn, &snippet)?;

    let mut extra = Map::new();
    extra.insert("kind".to_string(), json!("snippet"));
    extra.insert("tag".to_string(), json!(tag));
    extra.insert("root_id".to_string(), json!(state.root_id));
    let token = keys.issue(extra, ctxtoken::DEFAULT_TTL_SECS)?;

    Ok(json!({ "tag": tag, "ref": token }))
}

fn get_snippet(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let tag = require_str(args, "tag")?;
    let conn = open_conn(state)?;
    let snippet = sari_core::storage::db::get_snippet_by_tag(&conn, &state.root_id, tag)?
        .ok_or_else(|| SariError::InvalidArgs(format!("no snippet tagged {tag}")))?;
    Ok(json!({ "snippet": snippet }))
}

fn archive_context(state: &Arc<SharedState>, keys: &KeyStore, args: &Value) -> Result<Value> {
    let topic = require_str(args, "topic")?;
    let content = require_str(args, "content")?;
    let tags: Vec<String> = obj(args)
        .get("tags")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let related_files: Vec<String> = obj(args)
        .get("related_files")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let now = now_unix();

    let entry = sari_core::models::ContextEntry {
        id: None,
        topic: topic.to_string(),
        content: content.to_string(),
        tags,
        related_files,
        source: opt_str(args, "source").unwrap_or("").to_string(),
        valid_from: now,
        valid_until: obj(args).get("valid_until").and_then(Value::as_i64).unwrap_or(0),
        deprecated: false,
        created_ts: now,
        updated_ts: now,
    };

    let conn = sari_core::storage::db::open(&state.db_path())?;
    sari_core::storage::db::upsert_context(&conn, &entry)?;

    let mut extra = Map::new();
    extra.insert("kind".to_string(), json!("context"));
    extra.insert("topic".to_string(), json!(topic));
    let token = keys.issue(extra, ctxtoken::DEFAULT_TTL_SECS)?;

    Ok(json!({ "topic": topic, "ref": token }))
}

fn get_context(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let topic = require_str(args, "topic")?;
    let conn = open_conn(state)?;
    let entry = sari_core::storage::db::get_context_by_topic(&conn, topic)?
        .ok_or_else(|| SariError::InvalidArgs(format!("no context entry for topic {topic}")))?;
    Ok(json!({ "context": entry }))
}

fn status(state: &Arc<SharedState>, _args: &Value) -> Result<Value> {
    let conn = open_conn(state)?;
    let files = sari_core::storage::db::list_files_for_root(&conn, &state.root_id)?;
    Ok(json!({
        "root_id": state.root_id,
        "workspace_root": state.workspace_root.to_string_lossy(),
        "engine": state.engine_name(),
        "file_count": files.len(),
        "writer_queue_depth": state.writer_depth(),
        "refcount": state.refcount(),
        "persistent": state.is_persistent(),
        "last_activity": state.last_activity(),
    }))
}

/// Health check across storage and search: DB reachability, writer
/// backlog, and search engine identity. Degraded conditions are reported
/// as a reason string rather than failing the call outright, per the
/// "returns results or empty with a reason" contract.
fn doctor(state: &Arc<SharedState>, _args: &Value) -> Result<Value> {
    let db_ok = open_conn(state).is_ok();
    let queue_depth = state.writer_depth();
    let mut issues = Vec::new();
    if !db_ok {
        issues.push("database is unreachable");
    }
    if queue_depth > 10_000 {
        issues.push("writer queue backlog exceeds 10000 pending tasks");
    }
    Ok(json!({
        "db_reachable": db_ok,
        "engine": state.engine_name(),
        "writer_queue_depth": queue_depth,
        "healthy": issues.is_empty(),
        "issues": issues,
    }))
}

/// Reports what a rescan would change without writing anything
/// classification, minus the enqueue step).
fn dry_run_diff(state: &Arc<SharedState>, _args: &Value) -> Result<Value> {
    let stats = state.dry_run()?;
    Ok(json!({
        "would_change": stats.changed,
        "unchanged": stats.unchanged,
        "would_delete": stats.deleted,
        "skipped": stats.skipped,
    }))
}

fn index_file(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let rel_path = require_str(args, "path")?;
    let force = opt_bool(args, "force", false);
    state.index_one(rel_path, force)?;
    Ok(json!({ "path": rel_path, "indexed": true }))
}

fn rescan(state: &Arc<SharedState>, args: &Value) -> Result<Value> {
    let force = opt_bool(args, "force", false);
    let wait = opt_bool(args, "wait", false);
    let stats = state.rescan(force)?;
    if wait {
        state.flush(Duration::from_secs(30));
    }
    Ok(json!({
        "changed": stats.changed,
        "unchanged": stats.unchanged,
        "deleted": stats.deleted,
        "skipped": stats.skipped,
    }))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_str_rejects_missing_key() {
        let args = json!({});
        assert!(require_str(&args, "query").is_err());
    }

    #[test]
    fn require_str_rejects_empty_string() {
        let args = json!({ "query": "" });
        assert!(require_str(&args, "query").is_err());
    }

    #[test]
    fn opt_usize_falls_back_to_default() {
        let args = json!({});
        assert_eq!(opt_usize(&args, "limit", 50), 50);
    }

    #[test]
    fn unknown_tool_name_is_invalid_args() {
        let err = match "nonexistent_tool" {
            other => SariError::InvalidArgs(format!("unknown tool: {other}")),
        };
        assert_eq!(err.rpc_code(), sari_core::error::rpc_code::INVALID_ARGS);
    }
}
