//! Daemon entry point: consult the cross-process server registry,
//! bind the loopback listener, register this boot, optionally autostart a
//! pinned workspace, then accept connections — one thread per connection,
//! each running the session state machine over framed JSON-RPC.

use anyhow::Context;
use clap::Parser;
use sari_daemon::session::DaemonContext;
use sari_core::ctxtoken::{self, KeyStore};
use sari_core::registry::Registry;
use sari_core::server_registry::{self, ServerRegistry};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sari-daemon", version, about = "Loopback JSON-RPC daemon for the Sari code indexing service")]
struct Cli {
    /// Listener host (loopback only).
    #[arg(long, env = "SARI_DAEMON_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listener port; 0 lets the OS pick one.
    #[arg(long, env = "SARI_DAEMON_PORT", default_value_t = server_registry::DEFAULT_PORT)]
    port: u16,

    /// Workspace root to autostart (persistent, unrefcounted) on boot.
    #[arg(long, env = "SARI_WORKSPACE_ROOT")]
    workspace_root: Option<String>,

    /// Autostart `workspace_root` immediately rather than waiting for a session.
    #[arg(long, env = "SARI_DAEMON_AUTOSTART", default_value_t = false)]
    autostart: bool,

    /// Seconds of zero-session idleness before self-terminating. 0 disables.
    #[arg(long, env = "SARI_DAEMON_AUTOSTOP_GRACE_SEC", default_value_t = 0)]
    autostop_grace_sec: u64,

    /// Idle horizon for reaping zero-refcount, non-persistent shared states.
    #[arg(long, env = "SARI_DAEMON_IDLE_SEC", default_value_t = 1800)]
    idle_sec: u64,
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_terminate_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_terminate_signal as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_env("SARI_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sari=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    anyhow::ensure!(
        matches!(cli.host.as_str(), "127.0.0.1" | "::1" | "localhost"),
        "refusing non-loopback bind host {}",
        cli.host
    );

    let server_registry = Arc::new(ServerRegistry::open());

    if let Ok(Some((boot_id, entry))) = server_registry.resolve_daemon_by_endpoint(&cli.host, cli.port) {
        anyhow::bail!("endpoint {}:{} already owned by live daemon {boot_id} (pid {})", cli.host, cli.port, entry.pid);
    }

    let listener = TcpListener::bind((cli.host.as_str(), cli.port)).or_else(|_| {
        let port = ServerRegistry::find_free_port(&cli.host, cli.port, 200);
        TcpListener::bind((cli.host.as_str(), port))
    }).context("could not bind any loopback port")?;
    let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(cli.port);

    let boot_id = std::env::var("SARI_BOOT_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let pid = std::process::id() as i32;
    server_registry
        .register_daemon(&boot_id, &cli.host, bound_port, pid, env!("CARGO_PKG_VERSION"))
        .map_err(|e| anyhow::anyhow!("failed to register with the server registry: {e}"))?;

    let key_store = Arc::new(
        KeyStore::load_or_create(&ctxtoken::default_key_path())
            .map_err(|e| anyhow::anyhow!("failed to load context token keys: {e}"))?,
    );

    write_pid_file_best_effort(pid);

    let draining = Arc::new(AtomicBool::new(false));
    let ctx = Arc::new(DaemonContext {
        registry: Registry::global(),
        server_registry: server_registry.clone(),
        key_store,
        boot_id: boot_id.clone(),
        draining: draining.clone(),
    });

    if cli.autostart {
        if let Some(root) = &cli.workspace_root {
            match ctx.registry.get_or_create(std::path::Path::new(root), true, false) {
                Ok(state) => {
                    let _ = server_registry.set_workspace(root, &boot_id);
                    tracing::info!("autostarted workspace {} ({})", root, state.root_id);
                }
                Err(e) => tracing::warn!("autostart of {root} failed: {e}"),
            }
        }
    }

    install_signal_handlers();
    spawn_controller(ctx.clone(), cli.autostop_grace_sec, cli.idle_sec);

    tracing::info!("sari-daemon {boot_id} listening on {}:{bound_port}", cli.host);
    for incoming in listener.incoming() {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            break;
        }
        match incoming {
            Ok(stream) => {
                let ctx = ctx.clone();
                std::thread::spawn(move || handle_stream(ctx, stream));
            }
            Err(e) => tracing::debug!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn handle_stream(ctx: Arc<DaemonContext>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    sari_daemon::session::handle_connection(ctx, stream);
}

/// Heartbeats the registry entry and watches for the shutdown signal. Runs
/// for the life of the process; owns the drain sequence and, when
/// `autostop_grace_sec` is nonzero, idle self-termination.
fn spawn_controller(ctx: Arc<DaemonContext>, autostop_grace_sec: u64, idle_sec: u64) {
    std::thread::spawn(move || {
        let mut idle_since: Option<std::time::Instant> = None;
        loop {
            std::thread::sleep(Duration::from_secs(1));
            let _ = ctx.server_registry.touch_daemon(&ctx.boot_id);
            ctx.registry.reap_stale(Duration::from_secs(idle_sec));

            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                ctx.draining.store(true, Ordering::SeqCst);
                let _ = ctx.server_registry.set_daemon_draining(&ctx.boot_id, true);
                std::thread::sleep(Duration::from_secs(2));
                let _ = ctx.server_registry.unregister_daemon(&ctx.boot_id);
                remove_pid_file_best_effort();
                std::process::exit(0);
            }

            if autostop_grace_sec == 0 {
                continue;
            }
            if ctx.registry.is_empty() {
                let since = idle_since.get_or_insert_with(std::time::Instant::now);
                if since.elapsed() >= Duration::from_secs(autostop_grace_sec) {
                    tracing::info!("idle with no bound workspaces for {autostop_grace_sec}s; self-terminating");
                    let _ = ctx.server_registry.unregister_daemon(&ctx.boot_id);
                    remove_pid_file_best_effort();
                    std::process::exit(0);
                }
            } else {
                idle_since = None;
            }
        }
    });
}

fn write_pid_file_best_effort(pid: i32) {
    let path = sari_core::config::sari_data_dir().join("daemon.pid");
    let _ = std::fs::write(path, pid.to_string());
}

fn remove_pid_file_best_effort() {
    let path = sari_core::config::sari_data_dir().join("daemon.pid");
    let _ = std::fs::remove_file(path);
}
