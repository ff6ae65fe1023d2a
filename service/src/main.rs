//! `tapedeckd` entry point.
//!
//! Per-user daemon that owns the capture/post-processing engine and serves
//! observers over a Unix socket.
//!
//! ## Modes
//!
//! - **Service mode** (default): load configuration, start the pipeline
//!   worker, accept connections until ctrl-c (or the optional idle timeout).
//! - **`--ping`**: connect to the running daemon, send a hello handshake,
//!   verify the response, then exit.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tapedeck_core::Orchestrator;
use tapedeck_core::config::{AppConfig, ConfigLoader};
use tapedeck_service::state::ServiceState;

/// Poll interval for the idle timer.
const IDLE_POLL_INTERVAL_SECS: u64 = 10;

/// How long shutdown waits for the capture tool and the running job.
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(about = "Tape capture and post-processing daemon")]
struct Args {
    /// Configuration file (defaults to ./tapedeck.toml, then the XDG config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Socket path (overrides the configured one)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Check that a daemon answers on the socket, then exit
    #[arg(long)]
    ping: bool,
}

/// Connect to the service socket, send a hello handshake and verify the
/// response.
fn ping(path: &Path) -> std::io::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
        std::io::Error::other(format!("ping: cannot connect to {}: {e}", path.display()))
    })?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let hello = serde_json::json!({
        "id": 0,
        "method": "hello",
        "params": {
            "protocol_version": tapedeck_service::PROTOCOL_VERSION,
            "client_version": "tapedeckd-ping",
        },
    })
    .to_string();
    stream.write_all(hello.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = std::io::BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let resp: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| std::io::Error::other(format!("ping: invalid response JSON: {e}")))?;
    if resp.get("result").is_some() {
        eprintln!("ping: service is alive");
        Ok(())
    } else {
        let msg = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error");
        Err(std::io::Error::other(format!("ping: hello failed: {msg}")))
    }
}

fn load_config(path: Option<&Path>) -> std::io::Result<AppConfig> {
    let loaded = match path {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::load_default(),
    };
    loaded.map_err(|e| std::io::Error::other(format!("Failed to load configuration: {e}")))
}

fn socket_path(args: &Args, config: &AppConfig) -> PathBuf {
    args.socket
        .clone()
        .or_else(|| config.service.socket_path.clone())
        .unwrap_or_else(tapedeck_service::default_socket_path)
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    if args.ping {
        let config = load_config(args.config.as_deref())?;
        return ping(&socket_path(&args, &config));
    }

    run_service(args)
}

#[tokio::main]
async fn run_service(args: Args) -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("tapedeckd v{} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config(args.config.as_deref())?;
    let path = socket_path(&args, &config);
    let idle_timeout = config.service.idle_timeout_secs.map(Duration::from_secs);
    tracing::info!(
        "Import root {}, library root {}",
        config.paths.import_root.display(),
        config.paths.library_root.display()
    );

    let orchestrator = Orchestrator::new(config);
    orchestrator.start();
    let state = Arc::new(ServiceState::new(orchestrator));

    let listener = tapedeck_service::ipc::bind(&path)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Signal received, shutting down");
        let _ = shutdown_tx_signal.send(true);
    });

    if let Some(idle_timeout) = idle_timeout {
        let state_idle = Arc::clone(&state);
        tokio::spawn(async move {
            let poll_interval = Duration::from_secs(IDLE_POLL_INTERVAL_SECS);
            loop {
                tokio::time::sleep(poll_interval).await;
                if state_idle.is_idle_for(idle_timeout).await {
                    tracing::info!(
                        "Idle timeout ({}s): no connections, no capture, no queued work. Exiting.",
                        idle_timeout.as_secs()
                    );
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        });
    }

    tapedeck_service::ipc::serve(Arc::clone(&state), listener, shutdown_rx).await?;

    state
        .orchestrator()
        .shutdown(Duration::from_secs(SHUTDOWN_GRACE_SECS))
        .await;
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!("Could not remove socket {}: {e}", path.display());
    }

    tracing::info!("tapedeckd exiting cleanly");
    Ok(())
}
