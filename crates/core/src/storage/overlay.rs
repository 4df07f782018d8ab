//! L2: process-wide in-memory overlay, keyed by db path.
//!
//! A version guard drops any incoming row older than what is already
//! present. Bounded by `STORAGE_OVERLAY_SIZE` with LRU eviction on insert.
//! Eviction on commit-confirmation is driven by explicit message passing
//! (a list of committed paths) rather than a callback holding a reference
//! back into this map, avoiding the overlay/writer/callback cycle described
//! in the design notes.

use crate::models::OverlayRow;
use std::collections::HashMap;
use std::sync::Mutex;

struct Entry {
    row: OverlayRow,
    order: u64,
}

pub struct Overlay {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    map: HashMap<String, Entry>,
    clock: u64,
}

impl Overlay {
    pub fn new(capacity: usize) -> Self {
        Overlay {
            inner: Mutex::new(Inner { map: HashMap::new(), clock: 0 }),
            capacity,
        }
    }

    /// Inserts or updates a row. Drops the incoming row if its `mtime` is
    /// older than the entry currently in the overlay.
    pub fn upsert(&self, row: OverlayRow) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.map.get(&row.db_path) {
            if row.mtime < existing.row.mtime {
                return;
            }
        }
        inner.clock += 1;
        let order = inner.clock;
        let key = row.db_path.clone();
        inner.map.insert(key, Entry { row, order });
        Self::evict_if_needed(&mut inner, self.capacity);
    }

    fn evict_if_needed(inner: &mut Inner, capacity: usize) {
        while inner.map.len() > capacity {
            if let Some(oldest_key) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest_key);
            } else {
                break;
            }
        }
    }

    /// Removes rows by db path. Called with the list of paths a writer
    /// batch just committed to L3, so L2 never serves data that a reader
    /// could equally get (more freshly) from the durable store.
    pub fn evict_committed(&self, paths: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        for p in paths {
            inner.map.remove(p);
        }
    }

    /// Substring match over normalized snippet text and path, returning
    /// matches with the fixed overlay score of 100.0.
    pub fn search_substring(&self, needle_norm: &str, root_ids: Option<&[String]>) -> Vec<OverlayRow> {
        let inner = self.inner.lock().unwrap();
        inner
            .map
            .values()
            .filter(|e| {
                let root_ok = root_ids
                    .map(|ids| ids.iter().any(|id| id == &e.row.root_id))
                    .unwrap_or(true);
                root_ok && (e.row.snippet_norm.contains(needle_norm) || e.row.path.to_lowercase().contains(needle_norm))
            })
            .map(|e| e.row.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(path: &str, mtime: i64) -> OverlayRow {
        OverlayRow {
            db_path: path.to_string(),
            root_id: "r1".to_string(),
            repo: "repo".to_string(),
            mtime,
            size: 1,
            path: path.to_string(),
            snippet_norm: format!("body of {path}"),
        }
    }

    #[test]
    fn older_mtime_is_dropped() {
        let overlay = Overlay::new(10);
        overlay.upsert(row("r1/a.rs", 200));
        overlay.upsert(row("r1/a.rs", 100));
        let hits = overlay.search_substring("body", None);
        assert_eq!(hits[0].mtime, 200);
    }

    #[test]
    fn eviction_respects_capacity() {
        let overlay = Overlay::new(2);
        overlay.upsert(row("a", 1));
        overlay.upsert(row("b", 2));
        overlay.upsert(row("c", 3));
        assert_eq!(overlay.len(), 2);
    }

    #[test]
    fn commit_eviction_removes_rows() {
        let overlay = Overlay::new(10);
        overlay.upsert(row("a", 1));
        overlay.evict_committed(&["a".to_string()]);
        assert!(overlay.is_empty());
    }
}
