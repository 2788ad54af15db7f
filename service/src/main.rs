//! `instrux-service` entry point.
//!
//! ## Modes
//!
//! - **Service mode** (default): load the catalog, start the IPC server,
//!   write periodic snapshots, exit on Ctrl+C or after the idle timeout.
//! - **`--ping`**: connect to the running service socket, send a hello
//!   handshake, verify the response, then exit.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use instrux_catalog::{CatalogConfig, CatalogStore, SystemClock, UsageAggregator};
use instrux_service::dispatch::Dispatcher;
use tokio::sync::watch;

/// Poll interval for the idle timer.
const IDLE_POLL_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "instrux-service", version, about = "Instruction catalog service")]
struct Args {
    /// Socket path (defaults to $XDG_RUNTIME_DIR/instrux.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Catalog config file (defaults to $INSTRUX_CONFIG or ~/.config/instrux/catalog.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exit after this many seconds without connections (0 = never)
    #[arg(long, default_value_t = 0)]
    idle_timeout_secs: u64,

    /// Send a hello to the running service and exit
    #[arg(long)]
    ping: bool,
}

/// Connect to the service socket, send a hello handshake, verify the response.
fn ping(path: &Path) -> anyhow::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(path)
        .with_context(|| format!("ping: cannot connect to {}", path.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let hello = serde_json::json!({
        "id": 0,
        "method": "hello",
        "params": {
            "protocolVersion": instrux_service::PROTOCOL_VERSION,
            "clientVersion": "ping",
        }
    });
    let mut bytes = serde_json::to_vec(&hello)?;
    bytes.push(b'\n');
    stream.write_all(&bytes)?;
    stream.flush()?;

    let mut reader = std::io::BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let resp: serde_json::Value =
        serde_json::from_str(line.trim()).context("ping: invalid response JSON")?;
    if resp.get("result").is_some() {
        tracing::info!("ping: service is alive");
        Ok(())
    } else {
        let msg = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error");
        anyhow::bail!("ping: hello failed: {msg}")
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let socket = args
        .socket
        .unwrap_or_else(instrux_service::default_socket_path);

    let cfg = match &args.config {
        Some(path) => CatalogConfig::load_at(path),
        None => CatalogConfig::load(),
    }
    .context("failed to load catalog config")?;

    init_tracing(cfg.verbose);

    if args.ping {
        return ping(&socket);
    }

    run_service(cfg, socket, args.idle_timeout_secs)
}

#[tokio::main]
async fn run_service(cfg: CatalogConfig, socket: PathBuf, idle_timeout_secs: u64) -> anyhow::Result<()> {
    tracing::info!("instrux-service v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        instructions_dir = %cfg.resolved_instructions_dir().display(),
        snapshot_dir = %cfg.resolved_snapshot_dir().display(),
        mutation_enabled = cfg.mutation_enabled,
        "Catalog configuration"
    );

    let usage = UsageAggregator::spawn(&cfg.usage, Arc::new(SystemClock));
    let snapshot_interval = cfg.snapshot_interval_secs;
    let store = Arc::new(
        CatalogStore::open(cfg)
            .await
            .context("failed to open instruction catalog")?,
    );
    let summary = store.load().await.context("failed to load instruction catalog")?;
    if !summary.corrupted.is_empty() {
        tracing::warn!(
            corrupted = summary.corrupted.len(),
            "Some instruction files could not be loaded"
        );
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store), usage));
    let listener = instrux_service::ipc::bind(&socket)?;

    // Shutdown coordination via watch channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Signal received, shutting down");
        let _ = shutdown_tx_signal.send(true);
    });

    if snapshot_interval > 0 {
        let store = Arc::clone(&store);
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(snapshot_interval));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.write_snapshot().await {
                            tracing::warn!(error = %e, "Periodic snapshot failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    if idle_timeout_secs > 0 {
        let d = Arc::clone(&dispatcher);
        let idle_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let poll_interval = Duration::from_secs(IDLE_POLL_INTERVAL_SECS.min(idle_timeout_secs));
            let idle_timeout = Duration::from_secs(idle_timeout_secs);
            loop {
                tokio::time::sleep(poll_interval).await;
                if d.connection_count() == 0 && d.idle_for() >= idle_timeout {
                    tracing::info!(
                        "Idle timeout ({idle_timeout_secs}s): no connections. Exiting."
                    );
                    let _ = idle_tx.send(true);
                    break;
                }
            }
        });
    }

    instrux_service::ipc::serve(dispatcher, listener, shutdown_rx).await?;

    final_snapshot(&store).await;
    let _ = std::fs::remove_file(&socket);
    tracing::info!("instrux-service exiting cleanly");
    Ok(())
}

/// Final snapshot on shutdown when periodic snapshots are enabled.
async fn final_snapshot(store: &CatalogStore) {
    if store.config().snapshot_interval_secs == 0 {
        return;
    }
    if let Err(e) = store.write_snapshot().await {
        tracing::warn!(error = %e, "Shutdown snapshot failed");
    }
}
