use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gemini_relay::config::{Config, ConfigOverrides};
use gemini_relay::daemon::{run_daemon_with_shutdown, DaemonOptions};
use tokio::sync::Notify;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gemini-relay", version)]
struct Cli {
    /// Path to JSON config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept client WebSockets and relay them upstream
    Serve {
        /// Address to listen on (numeric ip:port)
        #[arg(long = "listen")]
        listen: Option<String>,

        /// Upstream WebSocket endpoint (ws:// or wss://)
        #[arg(long = "upstream-url")]
        upstream_url: Option<String>,

        /// Upstream API key
        #[arg(long = "api-key", env = "GEMINI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Give up on an upstream connect after this many milliseconds
        #[arg(long = "connect-timeout-ms")]
        connect_timeout_ms: Option<u64>,

        /// Reject client frames once this many are waiting for the upstream
        #[arg(long = "max-pending")]
        max_pending: Option<usize>,

        /// Also write logs to this file (truncated on start)
        #[arg(long = "log-file")]
        log_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            upstream_url,
            api_key,
            connect_timeout_ms,
            max_pending,
            log_file,
        } => {
            let overrides = ConfigOverrides {
                listen_addr: listen,
                upstream_url,
                api_key,
                connect_timeout_ms,
                max_pending_messages: max_pending,
                log_path: log_file,
            };
            let cfg = Config::load_with_overrides(cli.config.as_deref(), overrides)?;

            let shutdown = Arc::new(Notify::new());
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received interrupt, shutting down");
                    signal.notify_one();
                }
            });

            let opts = DaemonOptions {
                log_json: cli.log_json,
                ..Default::default()
            };
            run_daemon_with_shutdown(cfg, opts, shutdown).await?;
        }
    }

    Ok(())
}
