use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use session_bridge::bridge::{Bridge, BridgeHandle};
use session_bridge::config::Config;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Bridges a newline-delimited protocol on stdin/stdout onto a
/// reconnecting WebSocket. Only relayed protocol lines are written to
/// stdout; all diagnostics go to stderr.
#[derive(Debug, Parser)]
#[command(name = "session-bridge", version, about)]
struct Cli {
    /// WebSocket endpoint to bridge to (ws:// or wss://)
    endpoint: String,

    /// Initial-connect timeout in milliseconds
    #[arg(default_value_t = 10_000)]
    connect_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // A missing endpoint argument exits with the usage-error code 2 here.
    let cli = Cli::parse();

    let mut config = Config::new(cli.endpoint);
    config.connect_timeout = Duration::from_millis(cli.connect_timeout_ms);

    let (bridge, handle) = Bridge::new(config, BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    spawn_signal_listener(handle);

    match bridge.run().await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            tracing::error!(%error, "Bridge failed");
            ExitCode::from(1)
        }
    }
}

/// SIGINT and SIGTERM are handled identically to input EOF.
fn spawn_signal_listener(handle: BridgeHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::warn!(%error, "Unable to install SIGINT handler");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::warn!(%error, "Unable to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            _ = tokio::signal::ctrl_c().await;
        }
        handle.terminate();
    });
}
