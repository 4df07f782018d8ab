//! `sari` — thin JSON-RPC client for the Sari code indexing and search
//! daemon. Connects over a TCP loopback socket, frames one
//! `Content-Length`-delimited request per invocation, and prints the
//! daemon's response. Carries no dependency on `sari-core`/`sari-daemon`:
//! it only needs to speak the wire protocol those crates implement.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

/// Default daemon loopback port (matches the daemon's own default; see
/// `sari_core::server_registry::DEFAULT_PORT`).
const DEFAULT_PORT: u16 = 47790;
const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// `sari` — query a running Sari daemon from the terminal.
#[derive(Parser)]
#[command(name = "sari", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon host to connect to.
    #[arg(long, global = true, env = "SARI_DAEMON_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Daemon port to connect to.
    #[arg(long, global = true, env = "SARI_DAEMON_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Workspace root to bind the session to (default: current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Print the raw JSON-RPC response instead of a formatted summary.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the daemon's identity without binding a workspace.
    Identify,
    /// Full-text search across the indexed workspace.
    Search {
        query: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        regex: bool,
        #[arg(long)]
        case_sensitive: bool,
    },
    /// Look up symbols by name.
    SearchSymbols { name: String },
    /// List every indexed file under the bound workspace.
    ListFiles,
    /// Read a file's indexed content.
    ReadFile { path: String },
    /// List symbols declared in one file.
    ListSymbols { path: String },
    /// Read one symbol's indexed record.
    ReadSymbol { symbol_id: String },
    /// Callers of a symbol (one hop).
    GetCallers { symbol_id: String },
    /// Trait/interface implementations of a symbol (one hop).
    GetImplementations { symbol_id: String },
    /// One hop of callers and callees for a symbol.
    CallGraph { symbol_id: String },
    /// Save a line-range snippet under a tag, returning a context token.
    SaveSnippet {
        tag: String,
        path: String,
        #[arg(long, default_value_t = 1)]
        start_line: u32,
        #[arg(long, default_value_t = 1)]
        end_line: u32,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Fetch a previously saved snippet by tag.
    GetSnippet { tag: String },
    /// Archive a context entry under a topic, returning a context token.
    ArchiveContext {
        topic: String,
        content: String,
        #[arg(long)]
        tags: Vec<String>,
    },
    /// Fetch a previously archived context entry by topic.
    GetContext { topic: String },
    /// Workspace indexing status.
    Status,
    /// Health check across storage and search.
    Doctor,
    /// Report what a rescan would change without writing anything.
    DryRunDiff,
    /// Reindex a single file.
    IndexFile {
        path: String,
        #[arg(long)]
        force: bool,
    },
    /// Rescan the whole workspace.
    Rescan {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        wait: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("sari_cli=warn".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut conn = Connection::connect(&cli.host, cli.port)?;

    if matches!(cli.command, Commands::Identify) {
        let resp = conn.call("sari/identify", Value::Null)?;
        print_response(&resp, cli.json);
        return Ok(());
    }

    let root = cli
        .root
        .unwrap_or_else(|| std::env::current_dir().expect("could not determine current directory"))
        .canonicalize()
        .context("workspace root not found")?;
    let root_uri = format!("file://{}", root.display());
    conn.call("initialize", json!({ "rootUri": root_uri }))?;

    let (tool, params) = tool_call(cli.command)?;
    let resp = conn.call(&tool, params)?;
    print_response(&resp, cli.json);
    Ok(())
}

fn tool_call(command: Commands) -> Result<(String, Value)> {
    let (tool, params) = match command {
        Commands::Identify => unreachable!("handled before binding a workspace"),
        Commands::Search { query, limit, regex, case_sensitive } => {
            ("search", json!({ "query": query, "limit": limit, "use_regex": regex, "case_sensitive": case_sensitive }))
        }
        Commands::SearchSymbols { name } => ("search_symbols", json!({ "name": name })),
        Commands::ListFiles => ("list_files", json!({})),
        Commands::ReadFile { path } => ("read_file", json!({ "path": path })),
        Commands::ListSymbols { path } => ("list_symbols", json!({ "path": path })),
        Commands::ReadSymbol { symbol_id } => ("read_symbol", json!({ "symbol_id": symbol_id })),
        Commands::GetCallers { symbol_id } => ("get_callers", json!({ "symbol_id": symbol_id })),
        Commands::GetImplementations { symbol_id } => ("get_implementations", json!({ "symbol_id": symbol_id })),
        Commands::CallGraph { symbol_id } => ("call_graph", json!({ "symbol_id": symbol_id })),
        Commands::SaveSnippet { tag, path, start_line, end_line, note } => {
            ("save_snippet", json!({ "tag": tag, "path": path, "start_line": start_line, "end_line": end_line, "note": note }))
        }
        Commands::GetSnippet { tag } => ("get_snippet", json!({ "tag": tag })),
        Commands::ArchiveContext { topic, content, tags } => ("archive_context", json!({ "topic": topic, "content": content, "tags": tags })),
        Commands::GetContext { topic } => ("get_context", json!({ "topic": topic })),
        Commands::Status => ("status", json!({})),
        Commands::Doctor => ("doctor", json!({})),
        Commands::DryRunDiff => ("dry_run_diff", json!({})),
        Commands::IndexFile { path, force } => ("index_file", json!({ "path": path, "force": force })),
        Commands::Rescan { force, wait } => ("rescan", json!({ "force": force, "wait": wait })),
    };
    Ok((tool.to_string(), params))
}

/// Pretty-prints a successful result, or the daemon's PACK1 error
/// envelope when the tool call failed. A JSON-RPC protocol error (missing
/// method, not initialized, draining) lands in the top-level `error`
/// field; a tool-level failure lands inside `result` as a PACK1
/// `{isError: true, error: {...}}` envelope instead, since the session
/// layer never fails the RPC call itself for those (see `mcp::dispatch`).
fn print_response(resp: &Value, raw_json: bool) {
    if raw_json {
        println!("{}", serde_json::to_string_pretty(resp).unwrap_or_else(|_| resp.to_string()));
        return;
    }
    if let Some(error) = resp.get("error") {
        eprintln!("daemon error: {}", error.get("message").and_then(Value::as_str).unwrap_or("unknown error"));
        return;
    }
    let result = resp.get("result").unwrap_or(resp);
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = result.get("error").and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or("unknown error");
        eprintln!("tool error: {message}");
        return;
    }
    if let Some(text) = result.get("content").and_then(Value::as_array).and_then(|c| c.first()).and_then(|c| c.get("text")).and_then(Value::as_str) {
        match serde_json::from_str::<Value>(text) {
            Ok(payload) => println!("{}", serde_json::to_string_pretty(&payload).unwrap_or(text.to_string())),
            Err(_) => println!("{text}"),
        }
    } else {
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string()));
    }
}

/// One TCP connection to the daemon, framing requests with
/// `Content-Length: N\r\n\r\n<N bytes>` and a monotonic request id.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
}

impl Connection {
    fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).with_context(|| format!("could not connect to sari daemon at {host}:{port}"))?;
        let writer = stream.try_clone().context("could not clone daemon connection")?;
        Ok(Connection { reader: BufReader::new(stream), writer, next_id: 1 })
    }

    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let body = serde_json::to_vec(&request)?;
        write!(self.writer, "Content-Length: {}\r\n\r\n", body.len())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;

        let response = self.read_response()?;
        let parsed: Value = serde_json::from_slice(&response).context("daemon returned malformed JSON")?;
        if let Some(err) = parsed.get("error") {
            let message = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
            bail!("{method} failed: {message}");
        }
        Ok(parsed)
    }

    fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                bail!("daemon closed the connection before sending a response");
            }
            let raw = line.trim_end_matches(['\r', '\n']);
            if raw.is_empty() {
                break;
            }
            if let Some((name, value)) = raw.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }
        let len = content_length.ok_or_else(|| anyhow!("daemon response had no Content-Length header"))?;
        if len > MAX_MESSAGE_BYTES {
            bail!("daemon response of {len} bytes exceeds the {MAX_MESSAGE_BYTES}-byte cap");
        }
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body)?;
        Ok(body)
    }
}
