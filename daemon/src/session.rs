//! Per-connection session state machine: `sari/identify` never
//! binds a workspace; `initialize` binds one and only one; every later
//! tool call is refused with `-32002` until that happens. One thread per
//! connection; tool dispatch itself never runs on the thread reading
//! frames, matching the worker-pool routing the session life cycle calls
//! for — the pool here is the connection's own thread, since each
//! connection already gets a dedicated one.

use crate::mcp;
use crate::transport::{self, FrameMode, FrameState};
use sari_core::ctxtoken::KeyStore;
use sari_core::error::{rpc_code, Result as SariResult, SariError};
use sari_core::registry::Registry;
use sari_core::server_registry::ServerRegistry;
use serde_json::{json, Value};
use std::io::BufReader;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Daemon-wide state shared across every connection. Owned by `main`, one
/// instance per process.
pub struct DaemonContext {
    pub registry: &'static Registry,
    pub server_registry: Arc<ServerRegistry>,
    pub key_store: Arc<KeyStore>,
    pub boot_id: String,
    pub draining: Arc<AtomicBool>,
}

struct Session {
    initialized: bool,
    workspace: Option<(Arc<sari_core::registry::SharedState>, PathBuf)>,
    should_close: bool,
}

impl Session {
    fn new() -> Self {
        Session { initialized: false, workspace: None, should_close: false }
    }
}

/// Runs one connection to completion: sniffs framing, dispatches messages,
/// and releases any bound workspace when the peer disconnects.
pub fn handle_connection(ctx: Arc<DaemonContext>, stream: TcpStream) {
    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut writer = write_stream;
    let mut frame_state = FrameState::default();
    let mut session = Session::new();

    loop {
        let body = match transport::read_message(&mut reader, &mut frame_state) {
            Ok(Some(b)) => b,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("connection framing error: {e}");
                break;
            }
        };

        let response = handle_message(&ctx, &mut session, &body);
        if let Some(resp) = response {
            let mode = frame_state.mode().unwrap_or(FrameMode::ContentLength);
            if transport::write_message(&mut writer, mode, &resp).is_err() {
                break;
            }
        }
        if session.should_close {
            break;
        }
    }

    if let Some((_, root)) = session.workspace.take() {
        ctx.registry.release(&root);
    }
}

/// Parses and dispatches one framed message. Returns `None` for
/// notifications (no `id`), which never get a response.
fn handle_message(ctx: &Arc<DaemonContext>, session: &mut Session, body: &[u8]) -> Option<Vec<u8>> {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return Some(error_response(Value::Null, rpc_code::PARSE_ERROR, "malformed JSON-RPC message")),
    };

    let id = parsed.get("id").cloned();
    let method = match parsed.get("method").and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => return id.map(|id| error_response(id, rpc_code::PARSE_ERROR, "missing method")),
    };
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);

    if method == "notifications/initialized" || method == "notifications/cancelled" {
        return None;
    }
    if method == "exit" {
        session.should_close = true;
        return None;
    }

    let Some(id) = id else {
        // A notification for a method we don't special-case; no response
        // is ever sent to one, regardless of outcome.
        let _ = dispatch_method(ctx, session, &method, &params);
        return None;
    };

    match dispatch_method(ctx, session, &method, &params) {
        Ok(result) => Some(result_response(id, result)),
        Err((code, message)) => Some(error_response(id, code, &message)),
    }
}

fn dispatch_method(
    ctx: &Arc<DaemonContext>,
    session: &mut Session,
    method: &str,
    params: &Value,
) -> std::result::Result<Value, (i64, String)> {
    match method {
        "sari/identify" => Ok(identify(ctx)),
        "initialize" => initialize(ctx, session, params).map_err(|e| (e.rpc_code(), e.sanitized_message())),
        "shutdown" => Ok(Value::Null),
        "ping" => Ok(json!({})),
        tool => {
            if !session.initialized {
                return Err((rpc_code::NOT_INITIALIZED, "session is not initialized".to_string()));
            }
            if ctx.draining.load(Ordering::SeqCst) {
                return Err((rpc_code::DRAINING, "daemon is draining; reconnect to the latest daemon".to_string()));
            }
            let Some((state, _)) = session.workspace.as_ref() else {
                return Err((rpc_code::NOT_INITIALIZED, "no workspace bound".to_string()));
            };
            match mcp::dispatch(state, &ctx.key_store, tool, params) {
                Ok(payload) => {
                    let text = serde_json::to_string(&payload).unwrap_or_else(|_| "null".to_string());
                    Ok(serde_json::to_value(sari_core::pack::wrap(text)).unwrap())
                }
                Err(e) => Ok(serde_json::to_value(sari_core::pack::wrap_error(e.rpc_code(), e.sanitized_message())).unwrap()),
            }
        }
    }
}

fn identify(ctx: &Arc<DaemonContext>) -> Value {
    let draining = ctx.draining.load(Ordering::SeqCst);
    let mut out = json!({
        "name": "sari",
        "version": SERVER_VERSION,
        "protocolVersion": PROTOCOL_VERSION,
        "bootId": ctx.boot_id,
        "draining": draining,
    });
    if draining {
        if let Ok(Some((boot_id, entry))) = ctx.server_registry.resolve_latest_daemon(None, false) {
            if boot_id != ctx.boot_id {
                out["latest"] = json!({ "bootId": boot_id, "host": entry.host, "port": entry.port });
            }
        }
    }
    out
}

fn initialize(ctx: &Arc<DaemonContext>, session: &mut Session, params: &Value) -> SariResult<Value> {
    if ctx.draining.load(Ordering::SeqCst) {
        return Err(SariError::Draining);
    }

    let root_uri = params
        .get("rootUri")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| std::env::var("SARI_WORKSPACE_ROOT").ok().map(|p| format!("file://{p}")));
    let root_uri = root_uri.ok_or_else(|| SariError::InvalidArgs("missing rootUri and no SARI_WORKSPACE_ROOT".to_string()))?;
    let root_path = parse_file_uri(&root_uri)?;

    let state = ctx.registry.get_or_create(&root_path, false, true)?;
    let bound_root = state.workspace_root.clone();
    session.workspace = Some((state.clone(), bound_root));
    session.initialized = true;

    Ok(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": mcp_tool_names() },
        "bootId": ctx.boot_id,
        "rootId": state.root_id,
    }))
}

fn mcp_tool_names() -> &'static [&'static str] {
    &[
        "search",
        "search_symbols",
        "list_files",
        "read_file",
        "read_symbol",
        "list_symbols",
        "get_callers",
        "get_implementations",
        "call_graph",
        "save_snippet",
        "get_snippet",
        "archive_context",
        "get_context",
        "status",
        "doctor",
        "dry_run_diff",
        "index_file",
        "rescan",
    ]
}

/// Parses a `file://` URI, enforcing the loopback-only host rule (empty,
/// `localhost`, `127.0.0.1`, or `::1`).
fn parse_file_uri(uri: &str) -> SariResult<PathBuf> {
    let rest = uri.strip_prefix("file://").ok_or_else(|| SariError::InvalidArgs("rootUri must be a file:// URI".to_string()))?;
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if !matches!(host, "" | "localhost" | "127.0.0.1" | "::1") {
        return Err(SariError::InvalidArgs(format!("rootUri host {host} is not loopback")));
    }
    if path.is_empty() {
        return Err(SariError::InvalidArgs("rootUri has an empty path".to_string()));
    }
    Ok(PathBuf::from(path))
}

fn result_response(id: Value, result: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "jsonrpc": "2.0", "id": id, "result": result })).unwrap_or_default()
}

fn error_response(id: Value, code: i64, message: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_uri_accepts_empty_host() {
        let path = parse_file_uri("file:///home/user/project").unwrap();
        assert_eq!(path, PathBuf::from("/home/user/project"));
    }

    #[test]
    fn parse_file_uri_accepts_localhost() {
        let path = parse_file_uri("file://localhost/home/user/project").unwrap();
        assert_eq!(path, PathBuf::from("/home/user/project"));
    }

    #[test]
    fn parse_file_uri_rejects_remote_host() {
        assert!(parse_file_uri("file://example.com/etc/passwd").is_err());
    }

    #[test]
    fn parse_file_uri_rejects_non_file_scheme() {
        assert!(parse_file_uri("http://localhost/path").is_err());
    }
}
