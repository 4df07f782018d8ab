//! Search engine abstraction: a uniform interface over the embedded
//! full-text engine (tantivy) and the SQL `LIKE` fallback.

use crate::error::Result;
use std::path::Path;

#[derive(Clone, Debug)]
pub struct EngineDoc {
    pub root_id: String,
    pub path: String,
    pub repo: String,
    pub body: String,
    pub body_raw: String,
    pub mtime: i64,
    pub size: i64,
}

#[derive(Clone, Debug)]
pub struct EngineHit {
    pub path: String,
    pub score: f64,
}

pub trait SearchEngineHandle: Send + Sync {
    fn upsert_documents(&self, docs: &[EngineDoc]) -> Result<()>;
    fn delete_documents(&self, paths: &[String]) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn search(&self, query: &str, root_ids: Option<&[String]>, limit: usize) -> Result<Vec<EngineHit>>;
    fn name(&self) -> &'static str;
}

/// Escapes Lucene-style special characters unless the query already looks
/// like it is using field syntax, grouping, boolean operators, or `NEAR`.
pub fn build_query_string(query: &str) -> String {
    let looks_structured = query.contains(':')
        || query.contains('(')
        || query.contains(')')
        || query.contains(" AND ")
        || query.contains(" OR ")
        || query.contains(" NOT ")
        || query.contains("NEAR");
    if looks_structured {
        return query.to_string();
    }
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if "+-&|!(){}[]^\"~*?:\\/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub mod tantivy_engine {
    use super::*;
    use tantivy::collector::TopDocs;
    use tantivy::query::QueryParser;
    use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};
    use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Term};

    pub struct TantivyEngine {
        index: Index,
        writer: parking_lot::Mutex<IndexWriter>,
        reader: IndexReader,
        f_root_id: Field,
        f_path: Field,
        f_repo: Field,
        f_body: Field,
        f_body_raw: Field,
        f_mtime: Field,
        f_size: Field,
    }

    impl TantivyEngine {
        pub fn open_or_create(dir: &Path, memory_budget_bytes: usize) -> Result<Self> {
            std::fs::create_dir_all(dir)?;
            let mut schema_builder = Schema::builder();
            let f_root_id = schema_builder.add_text_field("root_id", STRING | STORED);
            let f_path = schema_builder.add_text_field("path", STRING | STORED);
            let f_repo = schema_builder.add_text_field("repo", STRING | STORED);
            let f_body = schema_builder.add_text_field("body", TEXT);
            let f_body_raw = schema_builder.add_text_field("body_raw", TEXT);
            let f_mtime = schema_builder.add_i64_field("mtime", STORED);
            let f_size = schema_builder.add_i64_field("size", STORED);
            let schema = schema_builder.build();

            let index = if dir.join("meta.json").exists() {
                Index::open_in_dir(dir).map_err(|e| crate::error::SariError::Engine(e.to_string()))?
            } else {
                Index::create_in_dir(dir, schema.clone())
                    .map_err(|e| crate::error::SariError::Engine(e.to_string()))?
            };
            let writer = index
                .writer(memory_budget_bytes.max(15_000_000))
                .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;
            let reader = index
                .reader_builder()
                .reload_policy(ReloadPolicy::OnCommitWithDelay)
                .try_into()
                .map_err(|e: tantivy::TantivyError| crate::error::SariError::Engine(e.to_string()))?;

            Ok(TantivyEngine {
                index,
                writer: parking_lot::Mutex::new(writer),
                reader,
                f_root_id,
                f_path,
                f_repo,
                f_body,
                f_body_raw,
                f_mtime,
                f_size,
            })
        }
    }

    impl SearchEngineHandle for TantivyEngine {
        fn upsert_documents(&self, docs: &[EngineDoc]) -> Result<()> {
            let mut writer = self.writer.lock();
            for d in docs {
                let term = Term::from_field_text(self.f_path, &d.path);
                writer.delete_term(term);
                writer
                    .add_document(doc!(
                        self.f_root_id => d.root_id.clone(),
                        self.f_path => d.path.clone(),
                        self.f_repo => d.repo.clone(),
                        self.f_body => d.body.clone(),
                        self.f_body_raw => d.body_raw.clone(),
                        self.f_mtime => d.mtime,
                        self.f_size => d.size,
                    ))
                    .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;
            }
            Ok(())
        }

        fn delete_documents(&self, paths: &[String]) -> Result<()> {
            let mut writer = self.writer.lock();
            for p in paths {
                writer.delete_term(Term::from_field_text(self.f_path, p));
            }
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            self.writer
                .lock()
                .commit()
                .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;
            self.reader
                .reload()
                .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;
            Ok(())
        }

        fn search(&self, query: &str, root_ids: Option<&[String]>, limit: usize) -> Result<Vec<EngineHit>> {
            let searcher = self.reader.searcher();
            let query_parser = QueryParser::for_index(&self.index, vec![self.f_body, self.f_body_raw]);
            let query_str = build_query_string(query);
            let full_query = match root_ids.filter(|v| !v.is_empty()) {
                Some(ids) => {
                    let root_clause = ids
                        .iter()
                        .map(|id| format!("root_id:\"{id}\""))
                        .collect::<Vec<_>>()
                        .join(" OR ");
                    format!("(body:({query_str})) AND ({root_clause})")
                }
                None => format!("body:({query_str})"),
            };
            let parsed = query_parser
                .parse_query(&full_query)
                .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;
            let top_docs = searcher
                .search(&parsed, &TopDocs::with_limit(limit))
                .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;

            let mut hits = Vec::new();
            for (score, addr) in top_docs {
                let retrieved = searcher
                    .doc::<tantivy::TantivyDocument>(addr)
                    .map_err(|e| crate::error::SariError::Engine(e.to_string()))?;
                if let Some(path_value) = retrieved.get_first(self.f_path) {
                    if let Some(path) = path_value.as_str() {
                        hits.push(EngineHit { path: path.to_string(), score: score as f64 });
                    }
                }
            }
            Ok(hits)
        }

        fn name(&self) -> &'static str {
            "tantivy"
        }
    }
}

pub mod sql_fallback {
    use super::*;
    use crate::storage::db;
    use std::sync::Mutex;

    /// SQL-only adapter: same interface, `LIKE`-based queries against the
    /// files table. Used when the embedded engine is unavailable or regex
    /// search is requested.
    pub struct SqlFallbackEngine {
        conn: Mutex<rusqlite::Connection>,
    }

    impl SqlFallbackEngine {
        pub fn new(db_path: &Path) -> Result<Self> {
            Ok(SqlFallbackEngine { conn: Mutex::new(db::open_readonly(db_path)?) })
        }
    }

    impl SearchEngineHandle for SqlFallbackEngine {
        fn upsert_documents(&self, _docs: &[EngineDoc]) -> Result<()> {
            // No-op: this adapter reads directly from the files table,
            // which the writer thread already maintains.
            Ok(())
        }

        fn delete_documents(&self, _paths: &[String]) -> Result<()> {
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            Ok(())
        }

        fn search(&self, query: &str, root_ids: Option<&[String]>, limit: usize) -> Result<Vec<EngineHit>> {
            let conn = self.conn.lock().unwrap();
            let rows = db::search_like(&conn, query, root_ids, limit)?;
            Ok(rows
                .into_iter()
                .map(|r| EngineHit { path: r.db_path(), score: 1.0 })
                .collect())
        }

        fn name(&self) -> &'static str {
            "sqlite"
        }
    }
}
