//! Single-writer queue and writer thread.
//!
//! Exactly one thread mutates `files`, `symbols`, `relations`, `snippets`,
//! `contexts`, and `failed_tasks`. It drains batches from an unbounded FIFO,
//! applies them inside one transaction in a fixed task-kind order, commits
//! the search engine once per batch after the DB transaction commits, and
//! on any failure rolls back and retries each task individually so one bad
//! task cannot sink the whole batch.

use crate::error::Result;
use crate::models::{TaskPayload, TaskQueueItem};
use crate::search::engine::{EngineDoc, SearchEngineHandle};
use crate::storage::db;
use crossbeam_channel::{Receiver, Sender};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const DEFAULT_MAX_BATCH: usize = 500;

pub struct WriterHandle {
    sender: Sender<TaskQueueItem>,
    depth: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// `queue_load = min(1.0, depth/5000)`, used by the coordinator to
/// throttle worker dispatch.
pub fn queue_load(depth: i64) -> f64 {
    (depth as f64 / 5000.0).min(1.0)
}

impl WriterHandle {
    pub fn spawn(
        db_path: PathBuf,
        engine: Arc<dyn SearchEngineHandle>,
        on_commit: impl Fn(Vec<String>) + Send + 'static,
    ) -> Result<Arc<WriterHandle>> {
        let (sender, receiver): (Sender<TaskQueueItem>, Receiver<TaskQueueItem>) = crossbeam_channel::unbounded();
        let depth = Arc::new(AtomicI64::new(0));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread_depth = depth.clone();
        let thread_stopped = stopped.clone();
        let conn = db::open(&db_path)?;

        let join = std::thread::Builder::new()
            .name("sari-writer".to_string())
            .spawn(move || {
                writer_loop(conn, receiver, engine, on_commit, thread_depth, thread_stopped);
            })
            .map_err(crate::error::SariError::Io)?;

        Ok(Arc::new(WriterHandle {
            sender,
            depth,
            stopped,
            join: std::sync::Mutex::new(Some(join)),
        }))
    }

    pub fn enqueue(&self, payload: TaskPayload) {
        let item = TaskQueueItem { payload, enqueued_ts: now_ts() };
        self.depth.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(item);
    }

    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn queue_load(&self) -> f64 {
        queue_load(self.depth())
    }

    /// Waits until the queue is empty or `timeout` elapses.
    pub fn flush(&self, timeout: std::time::Duration) {
        let deadline = std::time::Instant::now() + timeout;
        while self.depth() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    /// Idempotent: calling `stop()` twice is a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Sending a sentinel-free drop of the sender is done by dropping
        // this handle's clone; here we just join once the channel drains
        // naturally because the caller stops enqueueing.
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn writer_loop(
    conn: Connection,
    receiver: Receiver<TaskQueueItem>,
    engine: Arc<dyn SearchEngineHandle>,
    on_commit: impl Fn(Vec<String>),
    depth: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
) {
    let max_batch = std::env::var("SARI_INDEX_L1_BATCH_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MAX_BATCH);
    loop {
        let mut batch = Vec::new();
        match receiver.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(item) => batch.push(item),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
        while batch.len() < max_batch {
            match receiver.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        let committed_paths = apply_batch(&conn, &engine, &batch);
        depth.fetch_sub(batch.len() as i64, Ordering::SeqCst);
        if !committed_paths.is_empty() {
            on_commit(committed_paths);
        }

        if stopped.load(Ordering::SeqCst) && receiver.is_empty() {
            return;
        }
    }
}

/// Orders tasks in a fixed sequence: deletions, file upserts, symbol upserts, relation
/// upserts, last-seen updates, snippet upserts, context upserts, DLQ
/// upserts, DLQ clears. Returns the list of file paths that were durably
/// committed, for L2 eviction.
fn apply_batch(conn: &Connection, engine: &Arc<dyn SearchEngineHandle>, batch: &[TaskQueueItem]) -> Vec<String> {
    match try_apply_batch(conn, engine, batch) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, "writer batch failed, retrying tasks individually");
            let mut committed = Vec::new();
            for item in batch {
                match try_apply_batch(conn, engine, std::slice::from_ref(item)) {
                    Ok(mut paths) => committed.append(&mut paths),
                    Err(e) => tracing::error!(error = %e, "writer task failed in isolation, dropping"),
                }
            }
            committed
        }
    }
}

fn try_apply_batch(conn: &Connection, engine: &Arc<dyn SearchEngineHandle>, batch: &[TaskQueueItem]) -> Result<Vec<String>> {
    let now = now_ts();
    let mut committed_paths = Vec::new();
    let mut engine_docs = Vec::new();
    let mut engine_deletes = Vec::new();

    let tx = conn.unchecked_transaction()?;

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::DeletePath { .. })) {
        if let TaskPayload::DeletePath { root_id, path } = &item.payload {
            let db_path = format!("{root_id}/{path}");
            db::tombstone_path(&tx, &db_path, now)?;
            engine_deletes.push(db_path.clone());
            committed_paths.push(db_path);
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::UpsertFiles(_))) {
        if let TaskPayload::UpsertFiles(files) = &item.payload {
            for file in files {
                let fired = db::upsert_file(&tx, file)?;
                let db_path = file.db_path();
                if fired {
                    db::delete_symbols_for_path(&tx, &db_path)?;
                    engine_docs.push(EngineDoc {
                        root_id: file.root_id.clone(),
                        path: db_path.clone(),
                        repo: file.repo.clone(),
                        body: file.fts_content.clone(),
                        body_raw: file.fts_content.clone(),
                        mtime: file.mtime,
                        size: file.size,
                    });
                }
                committed_paths.push(db_path);
            }
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::UpsertSymbols(_))) {
        if let TaskPayload::UpsertSymbols(symbols) = &item.payload {
            for s in symbols {
                db::insert_symbol(&tx, s)?;
            }
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::UpsertRelations(_))) {
        if let TaskPayload::UpsertRelations(relations) = &item.payload {
            for r in relations {
                db::insert_relation(&tx, r)?;
            }
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::UpdateLastSeen { .. })) {
        if let TaskPayload::UpdateLastSeen { root_id, paths, scan_ts } = &item.payload {
            for p in paths {
                db::update_last_seen(&tx, &format!("{root_id}/{p}"), *scan_ts)?;
            }
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::UpsertSnippets(_))) {
        if let TaskPayload::UpsertSnippets(snippets) = &item.payload {
            for s in snippets {
                db::upsert_snippet(&tx, s)?;
            }
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::UpsertContexts(_))) {
        if let TaskPayload::UpsertContexts(contexts) = &item.payload {
            for c in contexts {
                db::upsert_context(&tx, c)?;
            }
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::DlqUpsert(_))) {
        if let TaskPayload::DlqUpsert(f) = &item.payload {
            db::upsert_failed_task(&tx, f)?;
        }
    }

    for item in ordered(batch, |i| matches!(i.payload, TaskPayload::DlqClear { .. })) {
        if let TaskPayload::DlqClear { root_id: _, path } = &item.payload {
            db::clear_failed_task(&tx, path)?;
        }
    }

    // The engine defers its own commit until after the DB transaction
    // commits, so upserts/deletes become visible atomically with it.
    engine.upsert_documents(&engine_docs)?;
    engine.delete_documents(&engine_deletes)?;

    tx.commit()?;
    engine.commit()?;

    Ok(committed_paths)
}

fn ordered<'a>(batch: &'a [TaskQueueItem], pred: impl Fn(&TaskQueueItem) -> bool) -> impl Iterator<Item = &'a TaskQueueItem> {
    batch.iter().filter(move |i| pred(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileRecord, TaskPayload};
    use crate::search::engine::sql_fallback::SqlFallbackEngine;
    use tempfile::tempdir;

    struct NullEngine;
    impl SearchEngineHandle for NullEngine {
        fn upsert_documents(&self, _docs: &[EngineDoc]) -> Result<()> {
            Ok(())
        }
        fn delete_documents(&self, _paths: &[String]) -> Result<()> {
            Ok(())
        }
        fn commit(&self) -> Result<()> {
            Ok(())
        }
        fn search(&self, _q: &str, _r: Option<&[String]>, _l: usize) -> Result<Vec<crate::search::engine::EngineHit>> {
            Ok(Vec::new())
        }
        fn name(&self) -> &'static str {
            "null"
        }
    }

    #[test]
    fn writer_commits_file_and_evicts_overlay() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        {
            let conn = db::open(&db_path).unwrap();
            db::ensure_root(&conn, "r1", "/tmp/r1", "r1", 0).unwrap();
        }
        let committed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let committed_clone = committed.clone();
        let engine: Arc<dyn SearchEngineHandle> = Arc::new(NullEngine);
        let writer = WriterHandle::spawn(db_path.clone(), engine, move |paths| {
            committed_clone.lock().unwrap().extend(paths);
        })
        .unwrap();

        let file = FileRecord {
            root_id: "r1".to_string(),
            rel_path: "a.rs".to_string(),
            repo: "repo".to_string(),
            mtime: 1,
            size: 1,
            content: None,
            content_hash: "h".to_string(),
            fts_content: "fn a".to_string(),
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
        writer.enqueue(TaskPayload::UpsertFiles(vec![file]));
        writer.flush(std::time::Duration::from_secs(5));
        writer.stop();

        assert_eq!(committed.lock().unwrap().as_slice(), &["r1/a.rs".to_string()]);

        let ro = db::open_readonly(&db_path).unwrap();
        let rows = db::search_like(&ro, "fn a", None, 10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn sql_fallback_reads_committed_rows() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        {
            let conn = db::open(&db_path).unwrap();
            db::ensure_root(&conn, "r1", "/tmp/r1", "r1", 0).unwrap();
        }
        let engine: Arc<dyn SearchEngineHandle> = Arc::new(NullEngine);
        let writer = WriterHandle::spawn(db_path.clone(), engine, |_| {}).unwrap();
        let file = FileRecord {
            root_id: "r1".to_string(),
            rel_path: "b.rs".to_string(),
            repo: "repo".to_string(),
            mtime: 1,
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
        writer.enqueue(TaskPayload::UpsertFiles(vec![file]));
        writer.flush(std::time::Duration::from_secs(5));
        writer.stop();

        let fallback = SqlFallbackEngine::new(&db_path).unwrap();
        let hits = fallback.search("needle", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
