//! Cross-process server registry: the `server.json` file every
//! daemon on a machine reads and writes to discover each other, avoid
//! double-binding a `(host, port)` pair, and let a session find the daemon
//! that owns a given workspace. Protected by a sibling `.lock` file.
//!
//! Schema v2 is the source of truth: `daemons` keyed by boot id,
//! `workspaces` keyed by normalized root. A v1 `{instances}` file is
//! migrated in place on first read.

use crate::error::{Result, SariError};
use crate::workspace::normalize_path;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const SCHEMA_VERSION: &str = "2.0";
pub const DEFAULT_PORT: u16 = 47790;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DaemonEntry {
    pub host: String,
    pub port: u16,
    pub pid: i32,
    pub start_ts: f64,
    pub last_seen_ts: f64,
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorkspaceEntry {
    pub boot_id: String,
    pub last_active_ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_host: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct RegistryData {
    version: String,
    daemons: HashMap<String, DaemonEntry>,
    workspaces: HashMap<String, WorkspaceEntry>,
}

impl Default for RegistryData {
    fn default() -> Self {
        RegistryData { version: SCHEMA_VERSION.to_string(), daemons: HashMap::new(), workspaces: HashMap::new() }
    }
}

/// Legacy v1 shape: `{instances: {workspace_root: {pid, port, start_ts, version}}}`.
#[derive(Deserialize)]
struct LegacyInstance {
    pid: Option<i32>,
    port: Option<u16>,
    start_ts: Option<f64>,
    version: Option<String>,
}

#[derive(Deserialize)]
struct LegacyRegistryData {
    instances: HashMap<String, LegacyInstance>,
}

fn migrate_legacy(legacy: LegacyRegistryData) -> RegistryData {
    let now = now_unix_f64();
    let mut data = RegistryData::default();
    for (ws, info) in legacy.instances {
        let (Some(pid), Some(port)) = (info.pid, info.port) else { continue };
        let boot_id = format!("legacy-{pid}-{port}");
        data.daemons.insert(
            boot_id.clone(),
            DaemonEntry {
                host: "127.0.0.1".to_string(),
                port,
                pid,
                start_ts: info.start_ts.unwrap_or(now),
                last_seen_ts: now,
                draining: false,
                version: info.version.unwrap_or_else(|| "legacy".to_string()),
            },
        );
        data.workspaces.insert(ws, WorkspaceEntry { boot_id, last_active_ts: now, http_port: None, http_host: None });
    }
    data
}

fn parse_registry(content: &str) -> RegistryData {
    if let Ok(data) = serde_json::from_str::<RegistryData>(content) {
        if data.version == SCHEMA_VERSION {
            return data;
        }
    }
    if let Ok(legacy) = serde_json::from_str::<LegacyRegistryData>(content) {
        return migrate_legacy(legacy);
    }
    RegistryData::default()
}

fn now_unix_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Resolves the registry file path: `SARI_REGISTRY_FILE` override, then
/// `~/.local/share/sari/server.json`, falling back to `/tmp/sari/server.json`
/// when the home directory tree can't be created.
pub fn registry_path() -> PathBuf {
    if let Ok(over) = std::env::var("SARI_REGISTRY_FILE") {
        return PathBuf::from(over);
    }
    if let Some(home) = dirs::home_dir() {
        let primary = home.join(".local/share/sari/server.json");
        if ensure_parent_writable(&primary) {
            return primary;
        }
    }
    let fallback = std::env::var("SARI_REGISTRY_FALLBACK")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/sari/server.json"));
    ensure_parent_writable(&fallback);
    fallback
}

fn ensure_parent_writable(path: &Path) -> bool {
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent).is_ok(),
        None => false,
    }
}

struct LockGuard {
    #[cfg(unix)]
    file: std::fs::File,
}

#[cfg(unix)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(unix)]
fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<LockGuard> {
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).write(true).open(lock_path)?;
    let deadline = Instant::now() + timeout;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(LockGuard { file });
        }
        if Instant::now() >= deadline {
            return Err(SariError::Transient("server registry lock timed out".to_string()));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(not(unix))]
fn acquire_lock(_lock_path: &Path, _timeout: Duration) -> Result<LockGuard> {
    Ok(LockGuard {})
}

/// Checks process liveness the way the writer thread's heartbeat does:
/// `kill(pid, 0)` without actually signaling.
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: i32) -> bool {
    true
}

/// Handle onto the registry file. Cheap to construct; every operation
/// takes the file lock for its own duration.
pub struct ServerRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::open()
    }
}

impl ServerRegistry {
    pub fn open() -> Self {
        Self::with_path(registry_path())
    }

    pub fn with_path(path: PathBuf) -> Self {
        let lock_path = path.with_extension("json.lock");
        ServerRegistry { path, lock_path }
    }

    fn load_unlocked(&self) -> RegistryData {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_registry(&content),
            Err(_) => RegistryData::default(),
        }
    }

    fn atomic_write(&self, data: &RegistryData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension(format!("json.tmp.{}.{}", std::process::id(), now_unix_f64() as u64));
        let body = serde_json::to_vec_pretty(data).map_err(|e| SariError::Storage(format!("registry encode: {e}")))?;
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&body)?;
            f.flush()?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn with_lock<T>(&self, f: impl FnOnce(&mut RegistryData) -> T) -> Result<T> {
        let _guard = acquire_lock(&self.lock_path, DEFAULT_LOCK_TIMEOUT)?;
        let mut data = self.load_unlocked();
        let result = f(&mut data);
        self.atomic_write(&data)?;
        Ok(result)
    }

    fn read_lock<T>(&self, f: impl FnOnce(&RegistryData) -> T) -> Result<T> {
        let _guard = acquire_lock(&self.lock_path, DEFAULT_LOCK_TIMEOUT)?;
        Ok(f(&self.load_unlocked()))
    }

    fn prune_dead_locked(data: &mut RegistryData) {
        let dead: Vec<String> =
            data.daemons.iter().filter(|(_, d)| !is_process_alive(d.pid)).map(|(bid, _)| bid.clone()).collect();
        for bid in &dead {
            data.daemons.remove(bid);
        }
        if !dead.is_empty() {
            data.workspaces.retain(|_, ws| !dead.contains(&ws.boot_id));
        }
    }

    fn is_nested_pair(a: &str, b: &str) -> bool {
        if a.is_empty() || b.is_empty() || a == b {
            return false;
        }
        let a_pre = format!("{a}{}", std::path::MAIN_SEPARATOR);
        let b_pre = format!("{b}{}", std::path::MAIN_SEPARATOR);
        a.starts_with(&b_pre) || b.starts_with(&a_pre)
    }

    fn dedupe_nested_locked(data: &mut RegistryData, preferred: &str) {
        let remove: Vec<String> = data
            .workspaces
            .keys()
            .filter(|ws| ws.as_str() != preferred && Self::is_nested_pair(ws, preferred))
            .cloned()
            .collect();
        for ws in remove {
            data.workspaces.remove(&ws);
        }
    }

    fn normalize(root: &str) -> String {
        normalize_path(root).to_string_lossy().into_owned()
    }

    pub fn register_daemon(&self, boot_id: &str, host: &str, port: u16, pid: i32, version: &str) -> Result<()> {
        self.with_lock(|data| {
            Self::prune_dead_locked(data);
            let now = now_unix_f64();
            let prior = data.daemons.get(boot_id);
            let entry = DaemonEntry {
                host: host.to_string(),
                port,
                pid,
                start_ts: prior.map(|d| d.start_ts).unwrap_or(now),
                last_seen_ts: now,
                draining: prior.map(|d| d.draining).unwrap_or(false),
                version: if version.is_empty() {
                    prior.map(|d| d.version.clone()).unwrap_or_default()
                } else {
                    version.to_string()
                },
            };
            data.daemons.insert(boot_id.to_string(), entry);
        })
    }

    pub fn get_daemon(&self, boot_id: &str) -> Result<Option<DaemonEntry>> {
        let live = self.with_lock(|data| {
            let entry = data.daemons.get(boot_id).cloned();
            match &entry {
                Some(d) if !is_process_alive(d.pid) => {
                    data.daemons.remove(boot_id);
                    data.workspaces.retain(|_, ws| ws.boot_id != boot_id);
                    None
                }
                other => other.clone(),
            }
        })?;
        Ok(live)
    }

    pub fn unregister_daemon(&self, boot_id: &str) -> Result<()> {
        self.with_lock(|data| {
            data.daemons.remove(boot_id);
            data.workspaces.retain(|_, ws| ws.boot_id != boot_id);
        })
    }

    pub fn set_daemon_draining(&self, boot_id: &str, draining: bool) -> Result<()> {
        self.with_lock(|data| {
            if let Some(d) = data.daemons.get_mut(boot_id) {
                d.draining = draining;
                d.last_seen_ts = now_unix_f64();
            }
        })
    }

    pub fn touch_daemon(&self, boot_id: &str) -> Result<()> {
        self.with_lock(|data| {
            if let Some(d) = data.daemons.get_mut(boot_id) {
                d.last_seen_ts = now_unix_f64();
            }
        })
    }

    pub fn resolve_daemon_by_endpoint(&self, host: &str, port: u16) -> Result<Option<(String, DaemonEntry)>> {
        self.read_lock(|data| {
            data.daemons
                .iter()
                .find(|(_, d)| d.host == host && d.port == port && is_process_alive(d.pid))
                .map(|(bid, d)| (bid.clone(), d.clone()))
        })
    }

    /// Resolves the daemon owning `workspace_root`, falling back to the
    /// most-recently-seen live daemon on the machine when no workspace is
    /// given or the mapping is stale.
    pub fn resolve_latest_daemon(
        &self,
        workspace_root: Option<&str>,
        allow_draining: bool,
    ) -> Result<Option<(String, DaemonEntry)>> {
        self.read_lock(|data| {
            if let Some(root) = workspace_root {
                let ws = Self::normalize(root);
                if let Some(info) = data.workspaces.get(&ws) {
                    if let Some(d) = data.daemons.get(&info.boot_id) {
                        if (allow_draining || !d.draining) && is_process_alive(d.pid) {
                            return Some((info.boot_id.clone(), d.clone()));
                        }
                    }
                }
            }
            data.daemons
                .iter()
                .filter(|(_, d)| (allow_draining || !d.draining) && is_process_alive(d.pid))
                .max_by(|(_, a), (_, b)| a.last_seen_ts.total_cmp(&b.last_seen_ts))
                .map(|(bid, d)| (bid.clone(), d.clone()))
        })
    }

    pub fn get_workspace(&self, workspace_root: &str) -> Result<Option<WorkspaceEntry>> {
        let ws = Self::normalize(workspace_root);
        self.read_lock(|data| data.workspaces.get(&ws).cloned())
    }

    pub fn set_workspace(&self, workspace_root: &str, boot_id: &str) -> Result<()> {
        let ws = Self::normalize(workspace_root);
        self.with_lock(|data| {
            let entry = data.workspaces.entry(ws.clone()).or_default();
            entry.boot_id = boot_id.to_string();
            entry.last_active_ts = now_unix_f64();
            Self::dedupe_nested_locked(data, &ws);
        })
    }

    pub fn set_workspace_http(&self, workspace_root: &str, http_port: u16, http_host: Option<&str>) -> Result<()> {
        let ws = Self::normalize(workspace_root);
        self.with_lock(|data| {
            let entry = data.workspaces.entry(ws.clone()).or_default();
            entry.http_port = Some(http_port);
            if let Some(host) = http_host {
                entry.http_host = Some(host.to_string());
            }
            entry.last_active_ts = now_unix_f64();
            Self::dedupe_nested_locked(data, &ws);
        })
    }

    pub fn unregister_workspace(&self, workspace_root: &str) -> Result<()> {
        let ws = Self::normalize(workspace_root);
        self.with_lock(|data| {
            data.workspaces.remove(&ws);
        })
    }

    pub fn prune_dead(&self) -> Result<()> {
        self.with_lock(Self::prune_dead_locked)
    }

    /// Probes `start_port..start_port+max_tries` on `host` and returns the
    /// first that binds, or an OS-assigned ephemeral port as a last resort.
    pub fn find_free_port(host: &str, start_port: u16, max_tries: u16) -> u16 {
        for offset in 0..max_tries {
            let port = start_port.saturating_add(offset);
            if std::net::TcpListener::bind((host, port)).is_ok() {
                return port;
            }
        }
        std::net::TcpListener::bind((host, 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap_or(start_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry_at(dir: &Path) -> ServerRegistry {
        ServerRegistry::with_path(dir.join("server.json"))
    }

    #[test]
    fn register_then_get_daemon_round_trips() {
        let dir = tempdir().unwrap();
        let reg = registry_at(dir.path());
        reg.register_daemon("boot-1", "127.0.0.1", 47790, std::process::id() as i32, "0.1.0").unwrap();

        let daemon = reg.get_daemon("boot-1").unwrap().unwrap();
        assert_eq!(daemon.port, 47790);
        assert_eq!(daemon.host, "127.0.0.1");
    }

    #[test]
    fn get_daemon_prunes_dead_pid() {
        let dir = tempdir().unwrap();
        let reg = registry_at(dir.path());
        // PID 1 is init on any Linux box this test runs on; pick an
        // implausible high PID instead to simulate a dead process.
        reg.register_daemon("boot-dead", "127.0.0.1", 47791, 999_999_999, "0.1.0").unwrap();
        assert!(reg.get_daemon("boot-dead").unwrap().is_none());
    }

    #[test]
    fn set_workspace_then_resolve_latest_daemon() {
        let dir = tempdir().unwrap();
        let reg = registry_at(dir.path());
        let pid = std::process::id() as i32;
        reg.register_daemon("boot-1", "127.0.0.1", 47790, pid, "0.1.0").unwrap();
        reg.set_workspace("/tmp/proj", "boot-1").unwrap();

        let (boot_id, daemon) = reg.resolve_latest_daemon(Some("/tmp/proj"), true).unwrap().unwrap();
        assert_eq!(boot_id, "boot-1");
        assert_eq!(daemon.port, 47790);
    }

    #[test]
    fn nested_workspace_dedup_keeps_preferred() {
        let dir = tempdir().unwrap();
        let reg = registry_at(dir.path());
        let pid = std::process::id() as i32;
        reg.register_daemon("boot-1", "127.0.0.1", 47790, pid, "0.1.0").unwrap();
        reg.set_workspace("/tmp/proj", "boot-1").unwrap();
        reg.set_workspace("/tmp/proj/sub", "boot-1").unwrap();

        assert!(reg.get_workspace("/tmp/proj").unwrap().is_none());
        assert!(reg.get_workspace("/tmp/proj/sub").unwrap().is_some());
    }

    #[test]
    fn migrates_legacy_instances_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{"instances": {"/tmp/legacy": {"pid": 123456789, "port": 47790, "start_ts": 1.0, "version": "old"}}}"#,
        )
        .unwrap();
        let reg = ServerRegistry::with_path(path);
        let ws = reg.get_workspace("/tmp/legacy").unwrap().unwrap();
        assert_eq!(ws.boot_id, "legacy-123456789-47790");
    }

    #[test]
    fn find_free_port_returns_bindable_port() {
        let port = ServerRegistry::find_free_port("127.0.0.1", 0, 1);
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() || port == 0);
    }
}
