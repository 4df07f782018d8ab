//! L3: SQLite schema and row-level upsert semantics.

use crate::error::Result;
use crate::models::{ContextEntry, FailedTask, FileRecord, Relation, RelationKind, Snippet, Symbol, SymbolKind};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub const SCHEMA_VERSION: i64 = 1;

pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_readonly(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

        CREATE TABLE IF NOT EXISTS roots (
            root_id TEXT PRIMARY KEY,
            abs_path TEXT NOT NULL,
            real_path TEXT NOT NULL,
            label TEXT NOT NULL,
            created_ts INTEGER NOT NULL,
            updated_ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            rel_path TEXT NOT NULL,
            root_id TEXT NOT NULL,
            repo TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            content BLOB,
            content_hash TEXT NOT NULL,
            fts_content TEXT NOT NULL,
            scan_ts INTEGER NOT NULL,
            deleted_ts INTEGER NOT NULL DEFAULT 0,
            parse_status TEXT NOT NULL,
            parse_reason TEXT NOT NULL,
            ast_status TEXT NOT NULL,
            ast_reason TEXT NOT NULL,
            is_binary INTEGER NOT NULL,
            is_minified INTEGER NOT NULL,
            sampled INTEGER NOT NULL DEFAULT 0,
            content_bytes INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(root_id) REFERENCES roots(root_id)
        );
        CREATE INDEX IF NOT EXISTS idx_files_root ON files(root_id);

        CREATE TABLE IF NOT EXISTS symbols (
            symbol_id TEXT NOT NULL,
            path TEXT NOT NULL,
            root_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content TEXT NOT NULL,
            parent_qualname TEXT NOT NULL,
            qualname TEXT NOT NULL,
            docstring TEXT NOT NULL,
            importance REAL NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL,
            PRIMARY KEY (symbol_id, path)
        );
        CREATE INDEX IF NOT EXISTS idx_symbols_path ON symbols(path);
        CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);

        CREATE TABLE IF NOT EXISTS relations (
            from_root_id TEXT NOT NULL,
            from_path TEXT NOT NULL,
            from_symbol TEXT NOT NULL,
            from_symbol_id TEXT NOT NULL,
            to_root_id TEXT NOT NULL,
            to_path TEXT NOT NULL,
            to_symbol TEXT NOT NULL,
            to_symbol_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            call_site_line INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            PRIMARY KEY (from_path, from_symbol, to_path, to_symbol, kind, call_site_line)
        );
        CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_path, from_symbol);
        CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_path, to_symbol);

        CREATE TABLE IF NOT EXISTS snippets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag TEXT NOT NULL,
            root_id TEXT NOT NULL,
            path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            anchor_before TEXT NOT NULL,
            anchor_after TEXT NOT NULL,
            repo TEXT NOT NULL,
            note TEXT NOT NULL,
            commit_hash TEXT NOT NULL,
            created_ts INTEGER NOT NULL,
            updated_ts INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            UNIQUE(tag, root_id, path, start_line, end_line)
        );

        CREATE TABLE IF NOT EXISTS contexts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL UNIQUE,
            content TEXT NOT NULL,
            tags_json TEXT NOT NULL,
            related_files_json TEXT NOT NULL,
            source TEXT NOT NULL,
            valid_from INTEGER NOT NULL,
            valid_until INTEGER NOT NULL,
            deprecated INTEGER NOT NULL DEFAULT 0,
            created_ts INTEGER NOT NULL,
            updated_ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS failed_tasks (
            path TEXT PRIMARY KEY,
            root_id TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            error TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            next_retry INTEGER NOT NULL,
            metadata_json TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
        .optional()?;
    if existing.is_none() {
        conn.execute("INSERT INTO schema_version(version) VALUES (?1)", params![SCHEMA_VERSION])?;
    }
    Ok(())
}

pub fn ensure_root(conn: &Connection, root_id: &str, abs_path: &str, label: &str, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO roots(root_id, abs_path, real_path, label, created_ts, updated_ts)
         VALUES (?1, ?2, ?2, ?3, ?4, ?4)
         ON CONFLICT(root_id) DO UPDATE SET updated_ts=excluded.updated_ts",
        params![root_id, abs_path, label, now],
    )?;
    Ok(())
}

/// `INSERT ... ON CONFLICT(path) DO UPDATE ... WHERE excluded.mtime >= files.mtime`.
/// Symbols are only replaced when the UPDATE actually fires — a stale
/// retry must never drop symbols belonging to a fresher row.
pub fn upsert_file(conn: &Connection, file: &FileRecord) -> Result<bool> {
    let db_path = file.db_path();
    let prior_mtime: Option<i64> = conn
        .query_row("SELECT mtime FROM files WHERE path = ?1", params![db_path], |r| r.get(0))
        .optional()?;

    if let Some(prior_mtime) = prior_mtime {
        if file.mtime < prior_mtime {
            return Ok(false);
        }
    }

    conn.execute(
        "INSERT INTO files (path, rel_path, root_id, repo, mtime, size, content, content_hash,
            fts_content, scan_ts, deleted_ts, parse_status, parse_reason, ast_status, ast_reason,
            is_binary, is_minified, sampled, content_bytes, metadata_json, dirty)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,0,?11,?12,?13,?14,?15,?16,0,?17,?18,0)
         ON CONFLICT(path) DO UPDATE SET
            rel_path=excluded.rel_path, root_id=excluded.root_id, repo=excluded.repo,
            mtime=excluded.mtime, size=excluded.size, content=excluded.content,
            content_hash=excluded.content_hash, fts_content=excluded.fts_content,
            scan_ts=excluded.scan_ts, deleted_ts=0, parse_status=excluded.parse_status,
            parse_reason=excluded.parse_reason, ast_status=excluded.ast_status,
            ast_reason=excluded.ast_reason, is_binary=excluded.is_binary,
            is_minified=excluded.is_minified, content_bytes=excluded.content_bytes,
            metadata_json=excluded.metadata_json
         WHERE excluded.mtime >= files.mtime",
        params![
            db_path,
            file.rel_path,
            file.root_id,
            file.repo,
            file.mtime,
            file.size,
            file.content,
            file.content_hash,
            file.fts_content,
            file.scan_ts,
            file.parse_status,
            file.parse_reason,
            file.ast_status,
            file.ast_reason,
            file.is_binary as i64,
            file.is_minified as i64,
            file.content_bytes,
            file.metadata_json,
        ],
    )?;
    Ok(true)
}

pub fn delete_symbols_for_path(conn: &Connection, db_path: &str) -> Result<()> {
    conn.execute("DELETE FROM symbols WHERE path = ?1", params![db_path])?;
    Ok(())
}

pub fn insert_symbol(conn: &Connection, s: &Symbol) -> Result<()> {
    conn.execute(
        "INSERT INTO symbols (symbol_id, path, root_id, name, kind, start_line, end_line, content,
            parent_qualname, qualname, docstring, importance, metadata_json)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
         ON CONFLICT(symbol_id, path) DO UPDATE SET
            name=excluded.name, kind=excluded.kind, start_line=excluded.start_line,
            end_line=excluded.end_line, content=excluded.content,
            parent_qualname=excluded.parent_qualname, qualname=excluded.qualname,
            docstring=excluded.docstring, importance=excluded.importance,
            metadata_json=excluded.metadata_json",
        params![
            s.symbol_id,
            s.path,
            s.root_id,
            s.name,
            s.kind.as_str(),
            s.start_line,
            s.end_line,
            s.content,
            s.parent_qualname,
            s.qualname,
            s.docstring,
            s.importance,
            s.metadata_json,
        ],
    )?;
    Ok(())
}

pub fn insert_relation(conn: &Connection, r: &Relation) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO relations (from_root_id, from_path, from_symbol, from_symbol_id,
            to_root_id, to_path, to_symbol, to_symbol_id, kind, call_site_line, metadata_json)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            r.from_root_id,
            r.from_path,
            r.from_symbol,
            r.from_symbol_id,
            r.to_root_id,
            r.to_path,
            r.to_symbol,
            r.to_symbol_id,
            r.kind.as_str(),
            r.call_site_line,
            r.metadata_json,
        ],
    )?;
    Ok(())
}

pub fn update_last_seen(conn: &Connection, db_path: &str, scan_ts: i64) -> Result<()> {
    conn.execute("UPDATE files SET scan_ts = ?1 WHERE path = ?2", params![scan_ts, db_path])?;
    Ok(())
}

pub fn tombstone_path(conn: &Connection, db_path: &str, now: i64) -> Result<()> {
    conn.execute("UPDATE files SET deleted_ts = ?1 WHERE path = ?2", params![now, db_path])?;
    conn.execute("DELETE FROM symbols WHERE path = ?1", params![db_path])?;
    Ok(())
}

pub fn upsert_snippet(conn: &Connection, s: &Snippet) -> Result<()> {
    conn.execute(
        "INSERT INTO snippets (tag, root_id, path, start_line, end_line, content, content_hash,
            anchor_before, anchor_after, repo, note, commit_hash, created_ts, updated_ts, metadata_json)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
         ON CONFLICT(tag, root_id, path, start_line, end_line) DO UPDATE SET
            content=excluded.content, content_hash=excluded.content_hash,
            note=excluded.note, updated_ts=excluded.updated_ts",
        params![
            s.tag, s.root_id, s.path, s.start_line, s.end_line, s.content, s.content_hash,
            s.anchor_before, s.anchor_after, s.repo, s.note, s.commit_hash, s.created_ts,
            s.updated_ts, s.metadata_json,
        ],
    )?;
    Ok(())
}

pub fn upsert_context(conn: &Connection, c: &ContextEntry) -> Result<()> {
    let tags_json = serde_json::to_string(&c.tags).unwrap_or_default();
    let related_json = serde_json::to_string(&c.related_files).unwrap_or_default();
    conn.execute(
        "INSERT INTO contexts (topic, content, tags_json, related_files_json, source, valid_from,
            valid_until, deprecated, created_ts, updated_ts)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
         ON CONFLICT(topic) DO UPDATE SET content=excluded.content, tags_json=excluded.tags_json,
            related_files_json=excluded.related_files_json, source=excluded.source,
            valid_from=excluded.valid_from, valid_until=excluded.valid_until,
            deprecated=excluded.deprecated, updated_ts=excluded.updated_ts",
        params![
            c.topic, c.content, tags_json, related_json, c.source, c.valid_from, c.valid_until,
            c.deprecated as i64, c.created_ts, c.updated_ts,
        ],
    )?;
    Ok(())
}

pub fn upsert_failed_task(conn: &Connection, f: &FailedTask) -> Result<()> {
    conn.execute(
        "INSERT INTO failed_tasks (path, root_id, attempts, error, timestamp, next_retry, metadata_json)
         VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(path) DO UPDATE SET attempts=excluded.attempts, error=excluded.error,
            timestamp=excluded.timestamp, next_retry=excluded.next_retry",
        params![f.path, f.root_id, f.attempts, f.error, f.timestamp, f.next_retry, f.metadata_json],
    )?;
    Ok(())
}

pub fn clear_failed_task(conn: &Connection, path: &str) -> Result<()> {
    conn.execute("DELETE FROM failed_tasks WHERE path = ?1", params![path])?;
    Ok(())
}

pub fn get_prior_state(conn: &Connection, db_path: &str) -> Result<Option<(i64, i64, String)>> {
    conn.query_row(
        "SELECT mtime, size, content_hash FROM files WHERE path = ?1",
        params![db_path],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
    .map_err(Into::into)
}

/// Prior `(rel_path, mtime, size, content_hash)` for every non-deleted file
/// under a root, used to seed a rescan's unchanged/changed decision without
/// holding a DB connection across the parallel worker pool.
pub fn list_prior_states(conn: &Connection, root_id: &str) -> Result<Vec<(String, i64, i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT rel_path, mtime, size, content_hash FROM files WHERE root_id = ?1 AND deleted_ts = 0",
    )?;
    let rows = stmt.query_map(params![root_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Relative paths of every non-deleted file known under a root, used by the
/// rescan tombstone pass to detect vanished files.
pub fn list_live_paths(conn: &Connection, root_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT rel_path FROM files WHERE root_id = ?1 AND deleted_ts = 0")?;
    let rows = stmt.query_map(params![root_id], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn get_file(conn: &Connection, db_path: &str) -> Result<Option<FileRecord>> {
    conn.query_row(
        "SELECT path, rel_path, root_id, repo, mtime, size, content, content_hash, fts_content,
            scan_ts, deleted_ts, parse_status, parse_reason, ast_status, ast_reason, is_binary,
            is_minified, content_bytes, metadata_json
         FROM files WHERE path = ?1",
        params![db_path],
        |r| {
            Ok(FileRecord {
                root_id: r.get(2)?,
                rel_path: r.get(1)?,
                repo: r.get(3)?,
                mtime: r.get(4)?,
                size: r.get(5)?,
                content: r.get(6)?,
                content_hash: r.get(7)?,
                fts_content: r.get(8)?,
                scan_ts: r.get(9)?,
                deleted_ts: r.get(10)?,
                parse_status: r.get(11)?,
                parse_reason: r.get(12)?,
                ast_status: r.get(13)?,
                ast_reason: r.get(14)?,
                is_binary: r.get::<_, i64>(15)? != 0,
                is_minified: r.get::<_, i64>(16)? != 0,
                content_bytes: r.get(17)?,
                metadata_json: r.get(18)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_file_fts_content(conn: &Connection, db_path: &str) -> Result<Option<String>> {
    conn.query_row("SELECT fts_content FROM files WHERE path = ?1", params![db_path], |r| r.get(0))
        .optional()
        .map_err(Into::into)
}

pub fn list_files_for_root(conn: &Connection, root_id: &str) -> Result<Vec<FileRecord>> {
    let stmt = conn.prepare(
        "SELECT path, rel_path, root_id, repo, mtime, size, NULL, content_hash, fts_content, scan_ts,
            deleted_ts, parse_status, parse_reason, ast_status, ast_reason, is_binary, is_minified,
            content_bytes, metadata_json
         FROM files WHERE root_id = ?1 AND deleted_ts = 0 ORDER BY rel_path",
    )?;
    query_file_rows(stmt, &[&root_id])
}

fn symbol_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Symbol> {
    let kind_str: String = r.get(4)?;
    Ok(Symbol {
        symbol_id: r.get(0)?,
        path: r.get(1)?,
        root_id: r.get(2)?,
        name: r.get(3)?,
        kind: symbol_kind_from_str(&kind_str),
        start_line: r.get(5)?,
        end_line: r.get(6)?,
        content: r.get(7)?,
        parent_qualname: r.get(8)?,
        qualname: r.get(9)?,
        docstring: r.get(10)?,
        importance: r.get(11)?,
        metadata_json: r.get(12)?,
    })
}

fn symbol_kind_from_str(s: &str) -> SymbolKind {
    match s {
        "class" => SymbolKind::Class,
        "method" => SymbolKind::Method,
        "interface" => SymbolKind::Interface,
        "variable" => SymbolKind::Variable,
        "resource" => SymbolKind::Resource,
        "block" => SymbolKind::Block,
        _ => SymbolKind::Function,
    }
}

const SYMBOL_COLUMNS: &str = "symbol_id, path, root_id, name, kind, start_line, end_line, content,
            parent_qualname, qualname, docstring, importance, metadata_json";

pub fn list_symbols_for_path(conn: &Connection, db_path: &str) -> Result<Vec<Symbol>> {
    let mut stmt = conn.prepare(&format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE path = ?1 ORDER BY start_line"))?;
    let rows = stmt.query_map(params![db_path], |r| symbol_from_row(r))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn get_symbol_by_id(conn: &Connection, symbol_id: &str) -> Result<Option<Symbol>> {
    conn.query_row(
        &format!("SELECT {SYMBOL_COLUMNS} FROM symbols WHERE symbol_id = ?1 LIMIT 1"),
        params![symbol_id],
        |r| symbol_from_row(r),
    )
    .optional()
    .map_err(Into::into)
}

pub fn find_symbols_by_name(conn: &Connection, root_id: &str, name: &str) -> Result<Vec<Symbol>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SYMBOL_COLUMNS} FROM symbols WHERE root_id = ?1 AND name = ?2 ORDER BY path"
    ))?;
    let rows = stmt.query_map(params![root_id, name], |r| symbol_from_row(r))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn relation_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Relation> {
    let kind_str: String = r.get(8)?;
    Ok(Relation {
        from_root_id: r.get(0)?,
        from_path: r.get(1)?,
        from_symbol: r.get(2)?,
        from_symbol_id: r.get(3)?,
        to_root_id: r.get(4)?,
        to_path: r.get(5)?,
        to_symbol: r.get(6)?,
        to_symbol_id: r.get(7)?,
        kind: relation_kind_from_str(&kind_str),
        call_site_line: r.get(9)?,
        metadata_json: r.get(10)?,
    })
}

fn relation_kind_from_str(s: &str) -> RelationKind {
    match s {
        "implements" => RelationKind::Implements,
        "extends" => RelationKind::Extends,
        "overrides" => RelationKind::Overrides,
        "imports" => RelationKind::Imports,
        _ => RelationKind::Calls,
    }
}

const RELATION_COLUMNS: &str = "from_root_id, from_path, from_symbol, from_symbol_id, to_root_id,
            to_path, to_symbol, to_symbol_id, kind, call_site_line, metadata_json";

/// Relations originating at a symbol (e.g. what it calls/implements).
pub fn list_relations_from(conn: &Connection, from_symbol_id: &str) -> Result<Vec<Relation>> {
    let mut stmt = conn.prepare(&format!("SELECT {RELATION_COLUMNS} FROM relations WHERE from_symbol_id = ?1"))?;
    let rows = stmt.query_map(params![from_symbol_id], |r| relation_from_row(r))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Relations pointing at a symbol (its callers, its implementors).
pub fn list_relations_to(conn: &Connection, to_symbol_id: &str, kind: Option<RelationKind>) -> Result<Vec<Relation>> {
    let rows = if let Some(kind) = kind {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations WHERE to_symbol_id = ?1 AND kind = ?2"
        ))?;
        let rows = stmt.query_map(params![to_symbol_id, kind.as_str()], |r| relation_from_row(r))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out
    } else {
        let mut stmt = conn.prepare(&format!("SELECT {RELATION_COLUMNS} FROM relations WHERE to_symbol_id = ?1"))?;
        let rows = stmt.query_map(params![to_symbol_id], |r| relation_from_row(r))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out
    };
    Ok(rows)
}

pub fn get_snippet_by_tag(conn: &Connection, root_id: &str, tag: &str) -> Result<Option<Snippet>> {
    conn.query_row(
        "SELECT id, tag, root_id, path, start_line, end_line, content, content_hash, anchor_before,
            anchor_after, repo, note, commit_hash, created_ts, updated_ts, metadata_json
         FROM snippets WHERE root_id = ?1 AND tag = ?2 ORDER BY updated_ts DESC LIMIT 1",
        params![root_id, tag],
        |r| snippet_from_row(r),
    )
    .optional()
    .map_err(Into::into)
}

fn snippet_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Snippet> {
    Ok(Snippet {
        id: r.get(0)?,
        tag: r.get(1)?,
        root_id: r.get(2)?,
        path: r.get(3)?,
        start_line: r.get(4)?,
        end_line: r.get(5)?,
        content: r.get(6)?,
        content_hash: r.get(7)?,
        anchor_before: r.get(8)?,
        anchor_after: r.get(9)?,
        repo: r.get(10)?,
        note: r.get(11)?,
        commit_hash: r.get(12)?,
        created_ts: r.get(13)?,
        updated_ts: r.get(14)?,
        metadata_json: r.get(15)?,
    })
}

pub fn list_snippets(conn: &Connection, root_id: &str) -> Result<Vec<Snippet>> {
    let mut stmt = conn.prepare(
        "SELECT id, tag, root_id, path, start_line, end_line, content, content_hash, anchor_before,
            anchor_after, repo, note, commit_hash, created_ts, updated_ts, metadata_json
         FROM snippets WHERE root_id = ?1 ORDER BY updated_ts DESC",
    )?;
    let rows = stmt.query_map(params![root_id], |r| snippet_from_row(r))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn get_context_by_topic(conn: &Connection, topic: &str) -> Result<Option<ContextEntry>> {
    conn.query_row(
        "SELECT id, topic, content, tags_json, related_files_json, source, valid_from, valid_until,
            deprecated, created_ts, updated_ts
         FROM contexts WHERE topic = ?1",
        params![topic],
        |r| context_from_row(r),
    )
    .optional()
    .map_err(Into::into)
}

fn context_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ContextEntry> {
    let tags_json: String = r.get(3)?;
    let related_json: String = r.get(4)?;
    Ok(ContextEntry {
        id: r.get(0)?,
        topic: r.get(1)?,
        content: r.get(2)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        related_files: serde_json::from_str(&related_json).unwrap_or_default(),
        source: r.get(5)?,
        valid_from: r.get(6)?,
        valid_until: r.get(7)?,
        deprecated: r.get::<_, i64>(8)? != 0,
        created_ts: r.get(9)?,
        updated_ts: r.get(10)?,
    })
}

pub fn list_contexts(conn: &Connection) -> Result<Vec<ContextEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, topic, content, tags_json, related_files_json, source, valid_from, valid_until,
            deprecated, created_ts, updated_ts
         FROM contexts WHERE deprecated = 0 ORDER BY updated_ts DESC",
    )?;
    let rows = stmt.query_map([], |r| context_from_row(r))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn search_like(conn: &Connection, needle: &str, root_ids: Option<&[String]>, limit: usize) -> Result<Vec<FileRecord>> {
    let pattern = format!("%{}%", needle.to_lowercase());
    let mut stmt = if let Some(ids) = root_ids.filter(|v| !v.is_empty()) {
        let placeholders: Vec<String> = ids.iter().enumerate().map(|(i, _)| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT path, rel_path, root_id, repo, mtime, size, NULL, content_hash, fts_content, scan_ts,
                deleted_ts, parse_status, parse_reason, ast_status, ast_reason, is_binary, is_minified,
                content_bytes, metadata_json
             FROM files WHERE deleted_ts = 0 AND fts_content LIKE ?1 AND root_id IN ({})
             ORDER BY mtime DESC LIMIT ?2",
            placeholders.join(",")
        );
        let conn_stmt = conn.prepare(&sql)?;
        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&pattern, &(limit as i64)];
        for id in ids {
            params_vec.push(id);
        }
        return query_file_rows(conn_stmt, &params_vec);
    } else {
        conn.prepare(
            "SELECT path, rel_path, root_id, repo, mtime, size, NULL, content_hash, fts_content, scan_ts,
                deleted_ts, parse_status, parse_reason, ast_status, ast_reason, is_binary, is_minified,
                content_bytes, metadata_json
             FROM files WHERE deleted_ts = 0 AND fts_content LIKE ?1
             ORDER BY mtime DESC LIMIT ?2",
        )?
    };
    query_file_rows(stmt, &[&pattern, &(limit as i64)])
}

fn query_file_rows(mut stmt: rusqlite::Statement<'_>, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<FileRecord>> {
    let rows = stmt.query_map(params, |r| {
        Ok(FileRecord {
            root_id: r.get(2)?,
            rel_path: r.get(1)?,
            repo: r.get(3)?,
            mtime: r.get(4)?,
            size: r.get(5)?,
            content: None,
            content_hash: r.get(7)?,
            fts_content: r.get(8)?,
            scan_ts: r.get(9)?,
            deleted_ts: r.get(10)?,
            parse_status: r.get(11)?,
            parse_reason: r.get(12)?,
            ast_status: r.get(13)?,
            ast_reason: r.get(14)?,
            is_binary: r.get::<_, i64>(15)? != 0,
            is_minified: r.get::<_, i64>(16)? != 0,
            content_bytes: r.get(17)?,
            metadata_json: r.get(18)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_file(mtime: i64) -> FileRecord {
        FileRecord {
            root_id: "r1".to_string(),
            rel_path: "a.rs".to_string(),
            repo: "repo".to_string(),
            mtime,
            size: 10,
            content: None,
            content_hash: "h1".to_string(),
            fts_content: "fn a".to_string(),
            scan_ts: 1,
            deleted_ts: 0,
            parse_status: "ok".to_string(),
            parse_reason: "none".to_string(),
            ast_status: "ok".to_string(),
            ast_reason: String::new(),
            is_binary: false,
            is_minified: false,
            content_bytes: 10,
            metadata_json: "{}".to_string(),
        }
    }

    #[test]
    fn monotone_mtime_guard() {
        let dir = tempdir().unwrap();
        let conn = open(&dir.path().join("t.db")).unwrap();
        ensure_root(&conn, "r1", "/tmp/r1", "r1", 0).unwrap();

        let fresh = sample_file(200);
        upsert_file(&conn, &fresh).unwrap();

        let mut stale = sample_file(100);
        stale.content_hash = "different".to_string();
        upsert_file(&conn, &stale).unwrap();

        let (mtime, _, hash) = get_prior_state(&conn, "r1/a.rs").unwrap().unwrap();
        assert_eq!(mtime, 200);
        assert_eq!(hash, "h1");
    }

    #[test]
    fn symbols_preserved_when_update_does_not_fire() {
        let dir = tempdir().unwrap();
        let conn = open(&dir.path().join("t.db")).unwrap();
        ensure_root(&conn, "r1", "/tmp/r1", "r1", 0).unwrap();
        upsert_file(&conn, &sample_file(200)).unwrap();

        let sym = Symbol {
            symbol_id: "sid".to_string(),
            root_id: "r1".to_string(),
            path: "r1/a.rs".to_string(),
            name: "a".to_string(),
            kind: SymbolKind::Function,
            start_line: 1,
            end_line: 1,
            content: "fn a".to_string(),
            parent_qualname: String::new(),
            qualname: "a".to_string(),
            docstring: String::new(),
            importance: 0.0,
            metadata_json: "{}".to_string(),
        };
        insert_symbol(&conn, &sym).unwrap();

        // stale retry: should not fire, symbols must remain
        upsert_file(&conn, &sample_file(100)).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM symbols WHERE path='r1/a.rs'", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
