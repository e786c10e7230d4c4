use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::info;

use crate::config::Config;
use crate::logging::{self, LogOptions};
use crate::registry::SessionRegistry;
use crate::server::{RelayServer, RelayState};
use crate::session::SessionContext;
use crate::telemetry::RelayStats;
use crate::upstream::WsConnector;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Overrides `Config::log_path`.
    pub log_path: Option<PathBuf>,
    pub log_json: bool,
    pub log_stdout: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            log_path: None,
            log_json: false,
            log_stdout: true,
        }
    }
}

/// Run the relay until `shutdown` is notified and every connection has drained.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let log_path = opts.log_path.or_else(|| cfg.log_path.clone());
    logging::init(&LogOptions {
        path: log_path.clone(),
        json: opts.log_json,
        stdout: opts.log_stdout,
    })?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cfg
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log = %log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "relay starting"
    );

    let server = start_relay(&cfg, shutdown).await?;
    server.wait().await;
    Ok(())
}

/// Wire the real upstream connector into a freshly bound relay server.
pub async fn start_relay(cfg: &Config, shutdown: Arc<Notify>) -> Result<RelayServer> {
    let connector = WsConnector::new(&cfg.upstream_base()?, cfg.api_key());
    let upstream = connector.redacted_endpoint();
    let ctx = SessionContext {
        connector: Arc::new(connector),
        registry: SessionRegistry::new(),
        stats: Arc::new(RelayStats::default()),
        settings: cfg.session_settings(),
    };
    RelayServer::start(&cfg.listen_addr, RelayState::new(ctx, upstream), shutdown).await
}
