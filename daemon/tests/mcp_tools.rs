//! Integration tests for the MCP tool surface (§6, §8 end-to-end scenarios),
//! dispatched directly against a `SharedState` built from a fixture
//! workspace — no socket, matching the teacher's in-process harness style.

mod helpers;

use helpers::TestHarness;
use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn fresh_index_and_search_finds_hello() {
    // §8 scenario 1: `search{query:"hello"}` after `rescan` returns a hit in
    // src/main.py with a highlighted snippet.
    let h = TestHarness::from_fixture("basic");
    let result = h.call_tool("search", json!({ "query": "hello" }));
    let hits = result["hits"].as_array().expect("hits array");
    assert!(!hits.is_empty(), "expected at least one hit, got {result}");

    let hit = hits.iter().find(|h| h["path"].as_str().unwrap_or("").ends_with("src/main.py"));
    let hit = hit.unwrap_or_else(|| panic!("no hit for src/main.py in {hits:?}"));
    assert!(hit["score"].as_f64().unwrap() > 0.0);
    let snippet = hit["snippet"].as_str().unwrap_or("");
    assert!(snippet.contains(">>>"), "expected a highlighted snippet, got {snippet:?}");
}

#[test]
#[serial]
fn search_symbols_finds_config() {
    let h = TestHarness::from_fixture("basic");
    let result = h.call_tool("search_symbols", json!({ "name": "Config" }));
    let symbols = result["symbols"].as_array().expect("symbols array");
    assert!(symbols.iter().any(|s| s["name"] == "Config"), "expected a Config symbol, got {symbols:?}");
}

#[test]
#[serial]
fn list_files_includes_fixture_files() {
    let h = TestHarness::from_fixture("basic");
    let result = h.call_tool("list_files", json!({}));
    let files: Vec<&str> = result["files"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert!(files.iter().any(|f| f.ends_with("lib.rs")));
    assert!(files.iter().any(|f| f.ends_with("README.md")));
}

#[test]
#[serial]
fn read_file_roundtrips_content() {
    let h = TestHarness::from_fixture("basic");
    let result = h.call_tool("read_file", json!({ "path": "src/lib.rs" }));
    let content = result["content"].as_str().unwrap();
    assert!(content.contains("process"));
}

#[test]
#[serial]
fn read_file_rejects_unknown_path() {
    let h = TestHarness::from_fixture("basic");
    let err = h.call_tool_err("read_file", json!({ "path": "src/does_not_exist.rs" }));
    assert_eq!(err.rpc_code(), sari_core::error::rpc_code::INVALID_ARGS);
}

#[test]
#[serial]
fn list_symbols_and_get_callers_see_relations() {
    let h = TestHarness::from_fixture("basic");
    let symbols = h.call_tool("list_symbols", json!({ "path": "src/lib.rs" }));
    let entries = symbols["symbols"].as_array().unwrap();
    let process_symbol = entries
        .iter()
        .find(|s| s["name"] == "process")
        .unwrap_or_else(|| panic!("no `process` symbol in {entries:?}"));
    let symbol_id = process_symbol["symbol_id"].as_str().unwrap();

    let callers = h.call_tool("get_callers", json!({ "symbol_id": symbol_id }));
    assert!(callers["callers"].is_array());
}

#[test]
#[serial]
fn save_and_get_snippet_round_trips() {
    let h = TestHarness::from_fixture("basic");
    h.call_tool(
        "save_snippet",
        json!({ "tag": "greet-fn", "path": "src/lib.rs", "start_line": 1, "end_line": 3 }),
    );
    let got = h.call_tool("get_snippet", json!({ "tag": "greet-fn" }));
    assert_eq!(got["snippet"]["tag"], "greet-fn");
}

#[test]
#[serial]
fn archive_and_get_context_round_trips() {
    let h = TestHarness::from_fixture("basic");
    h.call_tool(
        "archive_context",
        json!({ "topic": "release-notes", "content": "v0.1 shipped" }),
    );
    let got = h.call_tool("get_context", json!({ "topic": "release-notes" }));
    assert_eq!(got["context"]["content"], "v0.1 shipped");
}

#[test]
#[serial]
fn status_reports_indexed_file_count() {
    let h = TestHarness::from_fixture("basic");
    let status = h.call_tool("status", json!({}));
    assert!(status["file_count"].as_u64().unwrap() >= 3);
    assert_eq!(status["engine"].as_str().unwrap(), "sqlite");
}

#[test]
#[serial]
fn doctor_reports_db_reachable() {
    let h = TestHarness::from_fixture("basic");
    let doctor = h.call_tool("doctor", json!({}));
    assert_eq!(doctor["db_reachable"], true);
}

#[test]
#[serial]
fn dry_run_diff_reports_no_changes_on_clean_tree() {
    let h = TestHarness::from_fixture("basic");
    let diff = h.call_tool("dry_run_diff", json!({}));
    assert_eq!(diff["would_change"].as_u64().unwrap(), 0);
}

#[test]
#[serial]
fn rescan_is_idempotent_on_an_unchanged_tree() {
    // §8 invariant: two successive scans of an unchanged tree produce zero
    // file-row changes.
    let h = TestHarness::from_fixture("basic");
    let first = h.call_tool("rescan", json!({ "wait": true }));
    assert_eq!(first["changed"].as_u64().unwrap(), 0, "fixture was already scanned by the harness");
    let second = h.call_tool("rescan", json!({ "wait": true }));
    assert_eq!(second["changed"].as_u64().unwrap(), 0);
    assert!(second["unchanged"].as_u64().unwrap() >= 3);
}

#[test]
#[serial]
fn index_file_reindexes_a_single_path() {
    let h = TestHarness::from_fixture("basic");
    h.call_tool("index_file", json!({ "path": "src/lib.rs", "force": true }));
    let result = h.call_tool("search", json!({ "query": "process" }));
    assert!(!result["hits"].as_array().unwrap().is_empty());
}
