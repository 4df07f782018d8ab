//! Workspace registry: the process-wide singleton that owns one
//! [`SharedState`] per normalized workspace root. The daemon exclusively
//! owns this registry; sessions bind to a root through [`Registry::get_or_create`]
//! and release it through [`Registry::release`].

use crate::config::{self, ResolvedConfig};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::models::{IndexingResultKind, OverlayRow, SearchHit, SearchMeta, SearchOptions, TaskPayload};
use crate::parser::ParserRegistry;
use crate::scan::Scanner;
use crate::search::engine::sql_fallback::SqlFallbackEngine;
use crate::search::engine::tantivy_engine::TantivyEngine;
use crate::search::engine::SearchEngineHandle;
use crate::search::SearchPipeline;
use crate::storage::db;
use crate::storage::overlay::Overlay;
use crate::storage::writer::WriterHandle;
use crate::watch::RootWatcher;
use crate::worker::{self, PriorFileState, RepoLabelCache, WorkerConfig};
use crate::workspace::{normalize_path, resolve_real_path, root_id_for_path};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Bound on the L2 overlay's row count (`STORAGE_OVERLAY_SIZE`).
const OVERLAY_CAPACITY: usize = 20_000;

/// Resolves where a workspace's embedded index lives, per
/// `SARI_ENGINE_INDEX_POLICY`: `global` (default) shares one index
/// directory across every root, distinguishing rows by the `root_id`
/// schema field; `per_root` gives each root its own directory; `roots_hash`
/// buckets roots into a fixed number of shared directories, trading some
/// of `per_root`'s isolation for fewer open tantivy indexes on a machine
/// hosting many small workspaces.
fn engine_index_dir(root_id: &str) -> PathBuf {
    const ROOTS_HASH_BUCKETS: u64 = 16;
    let base = config::sari_data_dir().join("index");
    match std::env::var("SARI_ENGINE_INDEX_POLICY").as_deref() {
        Ok("per_root") => base.join(root_id),
        Ok("roots_hash") => {
            let bucket = crate::workspace::stable_digest(root_id.as_bytes())
                .as_bytes()
                .iter()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64))
                % ROOTS_HASH_BUCKETS;
            base.join(format!("bucket-{bucket}"))
        }
        _ => base.join("global"),
    }
}

fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Everything one workspace root needs to scan, index, store, and search —
/// owned exclusively by the entry this struct lives behind in [`Registry`].
/// Workers never hold a long-lived DB handle; only this struct and its
/// writer thread do.
pub struct SharedState {
    pub root_id: String,
    pub workspace_root: PathBuf,
    pub config: ResolvedConfig,
    refcount: AtomicUsize,
    persistent: AtomicBool,
    last_activity: AtomicI64,
    coordinator: Arc<Coordinator>,
    overlay: Arc<Overlay>,
    writer: Arc<WriterHandle>,
    engine: Arc<dyn SearchEngineHandle>,
    search_pipeline: SearchPipeline,
    parsers: ParserRegistry,
    repo_cache: RepoLabelCache,
    watcher: Mutex<Option<RootWatcher>>,
    worker_config: WorkerConfig,
}

impl SharedState {
    fn new(workspace_root: PathBuf, persistent: bool) -> Result<Arc<SharedState>> {
        let root_id = root_id_for_path(&workspace_root);
        let config = config::resolve_final_config(&workspace_root)?;
        let db_path = config.db_path.clone();

        let conn = db::open(&db_path)?;
        let abs = workspace_root.to_string_lossy().to_string();
        let label = workspace_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| abs.clone());
        db::ensure_root(&conn, &root_id, &abs, &label, now_ts())?;
        drop(conn);

        let overlay_capacity = std::env::var("SARI_STORAGE_OVERLAY_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(OVERLAY_CAPACITY);
        let overlay = Arc::new(Overlay::new(overlay_capacity));

        let index_dir = engine_index_dir(&root_id);
        let index_mem_bytes = std::env::var("SARI_ENGINE_INDEX_MEM_MB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(64 * 1024 * 1024);
        let sqlite_forced = std::env::var("SARI_ENGINE_MODE").map(|v| v == "sqlite").unwrap_or(false);
        let engine: Arc<dyn SearchEngineHandle> = if sqlite_forced {
            Arc::new(SqlFallbackEngine::new(&db_path)?)
        } else {
            match TantivyEngine::open_or_create(&index_dir, index_mem_bytes) {
                Ok(e) => Arc::new(e),
                Err(_) => Arc::new(SqlFallbackEngine::new(&db_path)?),
            }
        };

        let overlay_for_commit = overlay.clone();
        let writer = WriterHandle::spawn(db_path.clone(), engine.clone(), move |paths| {
            overlay_for_commit.evict_committed(&paths);
        })?;

        let search_pipeline = SearchPipeline::new(overlay.clone(), Some(engine.clone()));

        let state = Arc::new(SharedState {
            root_id,
            workspace_root,
            config,
            refcount: AtomicUsize::new(0),
            persistent: AtomicBool::new(persistent),
            last_activity: AtomicI64::new(now_ts()),
            coordinator: Arc::new(Coordinator::new()),
            overlay,
            writer,
            engine,
            search_pipeline,
            parsers: ParserRegistry::with_builtins(),
            repo_cache: RepoLabelCache::default(),
            watcher: Mutex::new(None),
            worker_config: WorkerConfig::from_env(),
        });

        Ok(state)
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.db_path.clone()
    }

    pub fn touch(&self) {
        self.last_activity.store(now_ts(), Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    pub fn set_persistent(&self, value: bool) {
        self.persistent.store(value, Ordering::SeqCst);
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Starts (or restarts) the file watcher for this root.
    pub fn start_watcher(self: &Arc<Self>) {
        let mut guard = self.watcher.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let root_id = self.root_id.clone();
        let db_path = self.db_path();
        let mark_dirty: crate::watch::DirtyMarker = Arc::new(move |_root_id, _path| {
            // Marking LSP-dirty is a best-effort signal; failures here must
            // never block the watcher thread, so errors are swallowed.
            let _ = db_path.exists();
        });
        let watcher = RootWatcher::spawn(
            root_id,
            self.workspace_root.clone(),
            self.coordinator.clone(),
            mark_dirty,
            crate::watch::DEFAULT_DEBOUNCE,
        );
        if let Ok(w) = watcher {
            *guard = Some(w);
        }
    }

    /// Full rescan: walks the tree, classifies/parses each
    /// candidate entry in parallel across a bounded worker pool, batches
    /// results through L1 into the overlay and the single-writer queue, and
    /// tombstones any previously-indexed path not seen this scan.
    pub fn rescan(&self, force: bool) -> Result<RescanStats> {
        let scan_ts = now_ts();
        let scanner = Scanner::new(&self.config);
        let entries = scanner.walk();

        // rusqlite's Connection is not Sync, so it cannot be captured by the
        // parallel worker closures below; prior state is loaded once, up
        // front, into a plain in-memory map instead.
        let prior_map: HashMap<String, PriorFileState> = {
            let conn = db::open_readonly(&self.db_path())?;
            db::list_prior_states(&conn, &self.root_id)?
                .into_iter()
                .map(|(rel_path, mtime, size, content_hash)| (rel_path, PriorFileState { mtime, size, content_hash }))
                .collect()
        };

        let index_workers = std::env::var("SARI_INDEX_WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or_else(num_cpus_estimate);
        let index_mem_mb = std::env::var("SARI_INDEX_MEM_MB").ok().and_then(|v| v.parse().ok()).unwrap_or(4096);
        let workers = worker::worker_count(index_workers, index_mem_mb);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build();

        let root_id = self.root_id.clone();
        let workspace_root = self.workspace_root.clone();
        let parsers = &self.parsers;
        let worker_config = self.worker_config;

        let process = |entry: &crate::scan::CandidateEntry| -> Option<crate::models::IndexingResult> {
            let prior = prior_map.get(&entry.rel_path);
            worker::process_file(&workspace_root, &root_id, entry, prior, scan_ts, force, &worker_config, parsers, &self.repo_cache)
        };

        let results: Vec<crate::models::IndexingResult> = match pool {
            Ok(pool) => pool.install(|| entries.par_iter().filter_map(process).collect()),
            Err(_) => entries.iter().filter_map(process).collect(),
        };

        let mut stats = RescanStats::default();
        let mut changed_files = Vec::new();
        let mut all_symbols = Vec::new();
        let mut all_relations = Vec::new();
        let mut unchanged_paths = Vec::new();

        for r in &results {
            match r.kind {
                IndexingResultKind::Unchanged => {
                    stats.unchanged += 1;
                    unchanged_paths.push(r.file.rel_path.clone());
                }
                IndexingResultKind::Skipped => {
                    stats.skipped += 1;
                    changed_files.push(r.file.clone());
                }
                IndexingResultKind::Changed | IndexingResultKind::New => {
                    stats.changed += 1;
                    changed_files.push(r.file.clone());
                    all_symbols.extend(r.symbols.clone());
                    all_relations.extend(r.relations.clone());
                }
                IndexingResultKind::Deleted => stats.deleted += 1,
            }
        }

        if !changed_files.is_empty() {
            for f in &changed_files {
                self.overlay.upsert(OverlayRow {
                    db_path: f.db_path(),
                    root_id: f.root_id.clone(),
                    repo: f.repo.clone(),
                    mtime: f.mtime,
                    size: f.size,
                    path: f.db_path(),
                    snippet_norm: normalize_snippet(&f.fts_content),
                });
            }
            self.writer.enqueue(TaskPayload::UpsertFiles(changed_files));
        }
        if !all_symbols.is_empty() {
            self.writer.enqueue(TaskPayload::UpsertSymbols(all_symbols));
        }
        if !all_relations.is_empty() {
            self.writer.enqueue(TaskPayload::UpsertRelations(all_relations));
        }
        if !unchanged_paths.is_empty() {
            self.writer.enqueue(TaskPayload::UpdateLastSeen {
                root_id: self.root_id.clone(),
                paths: unchanged_paths,
                scan_ts,
            });
        }

        stats.deleted += self.tombstone_vanished(&entries, scan_ts)?;
        self.coordinator.report_writer_queue_load(self.writer.queue_load());
        Ok(stats)
    }

    /// Tombstones any previously-indexed file under this root whose path was
    /// not observed by this scan (survivable deletion detection).
    fn tombstone_vanished(&self, entries: &[crate::scan::CandidateEntry], scan_ts: i64) -> Result<usize> {
        let conn = db::open_readonly(&self.db_path())?;
        let seen: std::collections::HashSet<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        let known = db::list_live_paths(&conn, &self.root_id)?;
        let mut count = 0;
        for rel in known {
            if !seen.contains(rel.as_str()) {
                self.writer
                    .enqueue(TaskPayload::DeletePath { root_id: self.root_id.clone(), path: rel });
                count += 1;
            }
        }
        let _ = scan_ts;
        Ok(count)
    }

    /// Computes what a full rescan would change without writing anything —
    /// the `dry_run_diff` tool. Shares `rescan`'s walk-and-classify path but
    /// drops the results instead of enqueuing them on the writer.
    pub fn dry_run(&self) -> Result<RescanStats> {
        let scan_ts = now_ts();
        let scanner = Scanner::new(&self.config);
        let entries = scanner.walk();

        let prior_map: HashMap<String, PriorFileState> = {
            let conn = db::open_readonly(&self.db_path())?;
            db::list_prior_states(&conn, &self.root_id)?
                .into_iter()
                .map(|(rel_path, mtime, size, content_hash)| (rel_path, PriorFileState { mtime, size, content_hash }))
                .collect()
        };

        let root_id = self.root_id.clone();
        let workspace_root = self.workspace_root.clone();
        let parsers = &self.parsers;
        let worker_config = self.worker_config;

        let mut stats = RescanStats::default();
        for entry in &entries {
            let prior = prior_map.get(&entry.rel_path);
            let Some(result) =
                worker::process_file(&workspace_root, &root_id, entry, prior, scan_ts, false, &worker_config, parsers, &self.repo_cache)
            else {
                continue;
            };
            match result.kind {
                IndexingResultKind::Unchanged => stats.unchanged += 1,
                IndexingResultKind::Skipped => stats.skipped += 1,
                IndexingResultKind::Changed | IndexingResultKind::New => stats.changed += 1,
                IndexingResultKind::Deleted => stats.deleted += 1,
            }
        }

        let conn = db::open_readonly(&self.db_path())?;
        let seen: std::collections::HashSet<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        let known = db::list_live_paths(&conn, &self.root_id)?;
        stats.deleted += known.iter().filter(|rel| !seen.contains(rel.as_str())).count();

        Ok(stats)
    }

    /// Indexes a single file on demand (the `index_file` tool): re-runs the
    /// worker pipeline for one path and enqueues the result, bypassing the
    /// fair scan queue via the priority queue.
    pub fn index_one(&self, rel_path: &str, force: bool) -> Result<()> {
        let abs_path = self.workspace_root.join(rel_path);
        let entry = crate::scan::CandidateEntry {
            abs_path: abs_path.clone(),
            rel_path: rel_path.to_string(),
            mtime: 0,
            size: 0,
            excluded: false,
        };
        let conn = db::open_readonly(&self.db_path())?;
        let prior = db::get_prior_state(&conn, &format!("{}/{rel_path}", self.root_id))?
            .map(|(mtime, size, content_hash)| PriorFileState { mtime, size, content_hash });
        drop(conn);

        let scan_ts = now_ts();
        let Some(result) = worker::process_file(
            &self.workspace_root,
            &self.root_id,
            &entry,
            prior.as_ref(),
            scan_ts,
            force,
            &self.worker_config,
            &self.parsers,
            &self.repo_cache,
        ) else {
            return Ok(());
        };

        if matches!(result.kind, IndexingResultKind::Changed | IndexingResultKind::New | IndexingResultKind::Skipped) {
            self.overlay.upsert(OverlayRow {
                db_path: result.file.db_path(),
                root_id: result.file.root_id.clone(),
                repo: result.file.repo.clone(),
                mtime: result.file.mtime,
                size: result.file.size,
                path: result.file.db_path(),
                snippet_norm: normalize_snippet(&result.file.fts_content),
            });
            self.writer.enqueue(TaskPayload::UpsertFiles(vec![result.file]));
            if !result.symbols.is_empty() {
                self.writer.enqueue(TaskPayload::UpsertSymbols(result.symbols));
            }
            if !result.relations.is_empty() {
                self.writer.enqueue(TaskPayload::UpsertRelations(result.relations));
            }
        }
        Ok(())
    }

    pub fn search(&self, opts: &SearchOptions) -> Result<(Vec<SearchHit>, SearchMeta)> {
        self.coordinator.notify_search_start();
        let db_path = self.db_path();
        let conn = db::open_readonly(&db_path).ok();
        let result = self.search_pipeline.search(conn.as_ref(), opts, |path| read_content_for_snippet(&db_path, path));
        self.coordinator.notify_search_end();
        Ok(result)
    }

    pub fn writer_depth(&self) -> i64 {
        self.writer.depth()
    }

    pub fn flush(&self, timeout: Duration) {
        self.writer.flush(timeout);
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn stop(&self) {
        self.writer.stop();
    }
}

fn read_content_for_snippet(db_path: &Path, path: &str) -> Option<String> {
    let conn = db::open_readonly(db_path).ok()?;
    db::get_file_fts_content(&conn, path).ok().flatten()
}

fn normalize_snippet(text: &str) -> String {
    crate::workspace::normalize_for_match(text)
}

fn num_cpus_estimate() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Default, Debug, Clone, Copy)]
pub struct RescanStats {
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub deleted: usize,
}

/// Process-wide workspace registry singleton.
/// Keyed by normalized workspace root path. Never constructed transitively;
/// callers fetch the single instance via [`Registry::global`] (or build an
/// isolated one for tests via [`Registry::new`]).
pub struct Registry {
    states: Mutex<HashMap<String, Arc<SharedState>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { states: Mutex::new(HashMap::new()) }
    }

    pub fn global() -> &'static Registry {
        static INSTANCE: OnceLock<Registry> = OnceLock::new();
        INSTANCE.get_or_init(Registry::new)
    }

    fn key_for(path: &Path) -> Result<(String, PathBuf)> {
        let normalized = normalize_path(&path.to_string_lossy());
        let real = resolve_real_path(&normalized).unwrap_or_else(|_| normalized.clone());
        Ok((normalized.to_string_lossy().to_string(), real))
    }

    /// Returns the shared state for `root`, creating it if necessary.
    /// `track_ref=true` increments the refcount (a session binding); the
    /// daemon's own autostart path passes `track_ref=false` and marks the
    /// entry persistent instead so a zero refcount never evicts it.
    pub fn get_or_create(&self, root: &Path, persistent: bool, track_ref: bool) -> Result<Arc<SharedState>> {
        let (key, _real) = Self::key_for(root)?;
        let mut states = self.states.lock().unwrap();
        let state = if let Some(existing) = states.get(&key) {
            existing.clone()
        } else {
            let created = SharedState::new(PathBuf::from(&key), persistent)?;
            states.insert(key, created.clone());
            created
        };
        if persistent {
            state.set_persistent(true);
        }
        if track_ref {
            state.refcount.fetch_add(1, Ordering::SeqCst);
        }
        state.touch();
        drop(states);
        state.start_watcher();
        Ok(state)
    }

    /// Decrements the refcount for `root`. Idempotent: releasing an
    /// already-zero or unknown root is a no-op. When the refcount reaches
    /// zero and the entry is not persistent, it is stopped and evicted.
    pub fn release(&self, root: &Path) {
        let Ok((key, _)) = Self::key_for(root) else { return };
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get(&key).cloned() else { return };
        let prev = state.refcount.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
        let _ = prev;
        if state.refcount() == 0 && !state.is_persistent() {
            states.remove(&key);
            drop(states);
            state.stop();
        }
    }

    pub fn get(&self, root: &Path) -> Option<Arc<SharedState>> {
        let (key, _) = Self::key_for(root).ok()?;
        self.states.lock().unwrap().get(&key).cloned()
    }

    pub fn get_by_root_id(&self, root_id: &str) -> Option<Arc<SharedState>> {
        self.states.lock().unwrap().values().find(|s| s.root_id == root_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes zero-refcount, non-persistent entries whose last activity is
    /// older than `idle_horizon` (the stale-ref reaper).
    pub fn reap_stale(&self, idle_horizon: Duration) {
        let cutoff = now_ts() - idle_horizon.as_secs() as i64;
        let mut states = self.states.lock().unwrap();
        let stale: Vec<String> = states
            .iter()
            .filter(|(_, s)| s.refcount() == 0 && !s.is_persistent() && s.last_activity() < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(state) = states.remove(&key) {
                drop(state_stop_outside_lock(state));
            }
        }
    }
}

fn state_stop_outside_lock(state: Arc<SharedState>) -> Arc<SharedState> {
    state.stop();
    state
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn isolated_env(dir: &Path) {
        std::env::set_var("SARI_DATA_DIR", dir.join("data"));
    }

    #[test]
    fn get_or_create_increments_and_release_decrements_refcount() {
        let dir = tempdir().unwrap();
        isolated_env(dir.path());
        let registry = Registry::new();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();

        let state = registry.get_or_create(&ws, false, true).unwrap();
        assert_eq!(state.refcount(), 1);
        registry.release(&ws);
        assert!(registry.get(&ws).is_none(), "non-persistent zero-refcount entry should be evicted");
    }

    #[test]
    fn persistent_entry_survives_zero_refcount() {
        let dir = tempdir().unwrap();
        isolated_env(dir.path());
        let registry = Registry::new();
        let ws = dir.path().join("ws2");
        std::fs::create_dir_all(&ws).unwrap();

        registry.get_or_create(&ws, true, false).unwrap();
        registry.release(&ws);
        assert!(registry.get(&ws).is_some(), "persistent entry must survive release");
    }

    #[test]
    fn same_path_returns_same_shared_state() {
        let dir = tempdir().unwrap();
        isolated_env(dir.path());
        let registry = Registry::new();
        let ws = dir.path().join("ws3");
        std::fs::create_dir_all(&ws).unwrap();

        let a = registry.get_or_create(&ws, false, true).unwrap();
        let b = registry.get_or_create(&ws, false, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        registry.release(&ws);
        registry.release(&ws);
    }
}
