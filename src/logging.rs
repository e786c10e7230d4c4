use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt,
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "gemini_relay=info";

/// Output layers sit above the filter, so it gates every one of them.
type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Mirror every record into this file, truncated at startup.
    pub path: Option<PathBuf>,
    pub json: bool,
    pub stdout: bool,
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(opts: &LogOptions) -> Result<()> {
    let layers = build_layers(opts)?;
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(layers);
    if subscriber.try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn build_layers(opts: &LogOptions) -> Result<Vec<BoxedLayer>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if opts.stdout {
        if opts.json {
            layers.push(fmt::layer().json().boxed());
        } else {
            layers.push(fmt::layer().boxed());
        }
    }
    if let Some(path) = &opts.path {
        let file = open_log_file(path)?;
        let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
        if opts.json {
            layers.push(layer.json().boxed());
        } else {
            layers.push(layer.boxed());
        }
    }
    Ok(layers)
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    // New log file per run.
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log(dir: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(dir);
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        let log_path = tmp.join("relay.log");
        std::fs::write(&log_path, "old\n").unwrap();
        log_path
    }

    #[test]
    fn log_file_truncates_and_writes() {
        let log_path = temp_log("gemini-relay-log-test");
        let opts = LogOptions {
            path: Some(log_path.clone()),
            json: false,
            stdout: false,
        };
        let layers = build_layers(&opts).unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(layers);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(addr = %"127.0.0.1:3001", "relay listening");
            tracing::debug!("filtered out");
        });

        let raw = std::fs::read_to_string(&log_path).unwrap();
        assert!(!raw.contains("old"));
        assert!(raw.contains("INFO"));
        assert!(raw.contains("relay listening"));
        assert!(raw.contains("127.0.0.1:3001"));
        assert!(!raw.contains("filtered out"));
    }

    #[test]
    fn json_log_file_has_structured_fields() {
        let log_path = temp_log("gemini-relay-log-json-test");
        let opts = LogOptions {
            path: Some(log_path.clone()),
            json: true,
            stdout: false,
        };
        let layers = build_layers(&opts).unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(layers);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(session_id = %"abc", "pending queue full");
        });

        let raw = std::fs::read_to_string(&log_path).unwrap();
        let line: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["level"], "WARN");
        assert_eq!(line["fields"]["message"], "pending queue full");
        assert_eq!(line["fields"]["session_id"], "abc");
    }

    #[test]
    fn default_filter_keeps_dependency_chatter_out() {
        let log_path = temp_log("gemini-relay-log-filter-test");
        let opts = LogOptions {
            path: Some(log_path.clone()),
            json: false,
            stdout: false,
        };
        let layers = build_layers(&opts).unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(DEFAULT_FILTER))
            .with(layers);
        tracing::subscriber::with_default(subscriber, || {
            tracing::trace!(target: "axum::serve", "connection 127.0.0.1:1 accepted");
            tracing::info!(target: "tungstenite::handshake", "wss://upstream?key=secret");
            tracing::debug!(target: "gemini_relay::session", "discarding stale connect result");
            tracing::info!(target: "gemini_relay::server", "relay listening");
        });

        let raw = std::fs::read_to_string(&log_path).unwrap();
        assert!(raw.contains("relay listening"));
        assert!(!raw.contains("accepted"));
        assert!(!raw.contains("key=secret"));
        assert!(!raw.contains("stale connect result"));
    }

    #[test]
    fn log_dir_is_created() {
        let tmp = std::env::temp_dir().join("gemini-relay-log-dir-test");
        let _ = std::fs::remove_dir_all(&tmp);
        let path = tmp.join("nested").join("relay.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }
}
