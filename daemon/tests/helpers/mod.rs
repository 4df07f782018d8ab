//! Test harness for MCP tool integration tests.
//!
//! Builds a `SharedState` from a fixture directory in a temp workspace and
//! dispatches tool calls directly via `mcp::dispatch`, no socket involved.

use sari_core::ctxtoken::KeyStore;
use sari_core::registry::{Registry, SharedState};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestHarness {
    pub state: Arc<SharedState>,
    pub keys: KeyStore,
    _data_dir: TempDir,
    _workspace: TempDir,
}

fn copy_dir_recursive(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir_recursive(&from, &to);
        } else {
            std::fs::copy(&from, &to).unwrap();
        }
    }
}

impl TestHarness {
    /// Copies `fixture` into a fresh temp workspace, points `SARI_DATA_DIR`
    /// at a fresh temp data dir (so the global DB and index are isolated per
    /// test), registers the workspace, and runs one rescan.
    pub fn from_fixture(fixture: &str) -> Self {
        let fixture_src = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(fixture);
        assert!(fixture_src.exists(), "fixture {fixture} not found at {}", fixture_src.display());

        let data_dir = TempDir::new().expect("data dir");
        let workspace = TempDir::new().expect("workspace dir");
        copy_dir_recursive(&fixture_src, workspace.path());

        std::env::set_var("SARI_DATA_DIR", data_dir.path());
        std::env::set_var("SARI_ENGINE_MODE", "sqlite");

        let keys = KeyStore::load_or_create(&data_dir.path().join("ctx_keys.json")).expect("key store");

        let registry = Registry::global();
        let state = registry
            .get_or_create(workspace.path(), true, false)
            .expect("get_or_create");
        state.rescan(true).expect("initial rescan");

        TestHarness { state, keys, _data_dir: data_dir, _workspace: workspace }
    }

    /// Calls a tool by name and returns its raw JSON result (panics on error).
    pub fn call_tool(&self, name: &str, args: Value) -> Value {
        sari_daemon::mcp::dispatch(&self.state, &self.keys, name, &args)
            .unwrap_or_else(|e| panic!("tool {name} failed: {e:?}"))
    }

    pub fn call_tool_err(&self, name: &str, args: Value) -> sari_core::error::SariError {
        sari_daemon::mcp::dispatch(&self.state, &self.keys, name, &args)
            .expect_err(&format!("expected {name} to fail"))
    }
}
