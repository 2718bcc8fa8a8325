//! ws-echo: demo host for the embeddable WebSocket server.
//!
//! Every text message a client sends is broadcast back to all connected
//! clients.  Connection events are logged.
//!
//! # Usage
//!
//! ```text
//! ws-echo [OPTIONS]
//!
//! Options:
//!   --config          <PATH>  TOML config file
//!   --port            <PORT>  Listener port [default: 3013]
//!   --bind            <IP>    Bind address [default: 0.0.0.0]
//!   --max-connections <N>     Connection limit [default: 10]
//!   --watchdog-ms     <MS>    Watchdog period, 0 disables [default: 30000]
//!   --run-for         <SECS>  Stop after this many seconds instead of Ctrl+C
//! ```
//!
//! # Configuration precedence
//!
//! Built-in defaults, then the config file, then environment variables and
//! CLI flags (CLI wins over env).
//!
//! | Variable                  | Flag                |
//! |---------------------------|---------------------|
//! | `WS_ECHO_CONFIG`          | `--config`          |
//! | `WS_ECHO_PORT`            | `--port`            |
//! | `WS_ECHO_BIND`            | `--bind`            |
//! | `WS_ECHO_MAX_CONNECTIONS` | `--max-connections` |
//! | `WS_ECHO_WATCHDOG_MS`     | `--watchdog-ms`     |
//! | `WS_ECHO_RUN_FOR`         | `--run-for`         |
//!
//! The config file may also set `log_level`; `RUST_LOG` overrides it.
//!
//! ```toml
//! log_level = "debug"
//!
//! [server]
//! port = 3013
//! max_connections = 10
//! watchdog_period_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ws_server::{ServerConfig, WsServer};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Echo server built on ws-server.
///
/// Flags left unset keep the value from the config file (or the built-in
/// default when there is no file).
#[derive(Debug, Parser)]
#[command(
    name = "ws-echo",
    about = "Broadcasts every received WebSocket text message to all clients",
    version
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "WS_ECHO_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(long, env = "WS_ECHO_PORT")]
    port: Option<u16>,

    /// IP address to bind to (`0.0.0.0` for all interfaces).
    #[arg(long, env = "WS_ECHO_BIND")]
    bind: Option<String>,

    /// Maximum simultaneous connections.
    #[arg(long, env = "WS_ECHO_MAX_CONNECTIONS")]
    max_connections: Option<u32>,

    /// Watchdog period in milliseconds; 0 disables liveness checks.
    #[arg(long, env = "WS_ECHO_WATCHDOG_MS")]
    watchdog_ms: Option<u64>,

    /// Stop after this many seconds.  Runs until Ctrl+C when unset.
    #[arg(long, env = "WS_ECHO_RUN_FOR")]
    run_for: Option<u64>,
}

// ── Config file ───────────────────────────────────────────────────────────────

/// Contents of the optional TOML config file.
#[derive(Debug, Deserialize)]
struct EchoConfig {
    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    server: ServerConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
        }
    }
}

impl EchoConfig {
    fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("failed to parse config TOML")
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

impl Cli {
    /// Reads the config file named by `--config`, or returns defaults.
    fn file_config(&self) -> anyhow::Result<EchoConfig> {
        match &self.config {
            Some(path) => EchoConfig::load(path),
            None => Ok(EchoConfig::default()),
        }
    }

    /// Applies the flags that were given on top of `base` and validates.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged configuration is invalid (port 0,
    /// zero connection limit, unparsable bind address, ...).
    fn apply_to(&self, mut base: ServerConfig) -> anyhow::Result<ServerConfig> {
        if let Some(port) = self.port {
            base.port = port;
        }
        if let Some(bind) = &self.bind {
            base.bind_address = bind.clone();
        }
        if let Some(max) = self.max_connections {
            base.max_connections = max;
        }
        if let Some(ms) = self.watchdog_ms {
            base.watchdog_period_ms = ms;
        }
        base.validate().context("invalid server configuration")?;
        Ok(base)
    }

    fn run_for(&self) -> Option<Duration> {
        self.run_for.map(Duration::from_secs)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file = cli.file_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the config file's `log_level`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&file.log_level)),
        )
        .init();

    let config = cli.apply_to(file.server)?;
    info!(
        "ws-echo {} starting on {}:{}",
        ws_server::VERSION,
        config.bind_address,
        config.port
    );

    let server = Arc::new(WsServer::with_config(config).context("failed to create server")?);
    register_callbacks(&server);

    server
        .listen()
        .await
        .context("failed to start WebSocket server")?;

    wait_for_shutdown(cli.run_for()).await;

    server.close().await?;
    info!("ws-echo stopped");
    Ok(())
}

/// Wires the echo behaviour: every message is broadcast to everyone.
fn register_callbacks(server: &Arc<WsServer>) {
    // Weak, so the callback stored inside the server does not keep it alive.
    let echo = Arc::downgrade(server);
    server.set_on_message(move |msg| {
        let Some(server) = echo.upgrade() else {
            return;
        };
        match server.broadcast(msg) {
            Ok(report) => debug!(
                delivered = report.delivered,
                failed = report.failed,
                "echoed message"
            ),
            Err(e) => warn!("broadcast failed: {e}"),
        }
    });
    server.set_on_open(|peer| info!(peer, "client connected"));
    server.set_on_error(|reason| info!(reason, "client disconnected"));
}

/// Resolves on Ctrl+C, or after `run_for` when set.
async fn wait_for_shutdown(run_for: Option<Duration>) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C; shutting down"),
            Err(e) => {
                error!("failed to listen for Ctrl+C signal: {e}");
                // Without a signal handler, only --run-for can stop us.
                std::future::pending::<()>().await;
            }
        }
    };

    match run_for {
        Some(limit) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = tokio::time::sleep(limit) => info!("run time of {limit:?} elapsed"),
            }
        }
        None => ctrl_c.await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
