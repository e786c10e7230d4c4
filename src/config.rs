use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::session::SessionSettings;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3001";
pub const DEFAULT_UPSTREAM_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub max_pending_messages: Option<usize>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Values from the command line or environment; each one wins over the file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub listen_addr: Option<String>,
    pub upstream_url: Option<String>,
    pub api_key: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub max_pending_messages: Option<usize>,
    pub log_path: Option<PathBuf>,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            api_key: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_pending_messages: None,
            log_path: None,
            config_path: None,
        }
    }
}

// The api key must never reach a log line.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("upstream_url", &self.upstream_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("max_pending_messages", &self.max_pending_messages)
            .field("log_path", &self.log_path)
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_overrides(Some(path), ConfigOverrides::default())
    }

    /// Read the optional JSON file, then apply overrides, then validate.
    pub fn load_with_overrides(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                let mut cfg: Config =
                    serde_json::from_str(&data).context("parse config json")?;
                cfg.config_path = Some(path.to_path_buf());
                cfg
            }
            None => Config::default(),
        };
        cfg.apply(overrides);
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(addr) = overrides.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(url) = overrides.upstream_url {
            self.upstream_url = url;
        }
        if overrides.api_key.is_some() {
            self.api_key = overrides.api_key;
        }
        if let Some(ms) = overrides.connect_timeout_ms {
            self.connect_timeout_ms = ms;
        }
        if overrides.max_pending_messages.is_some() {
            self.max_pending_messages = overrides.max_pending_messages;
        }
        if overrides.log_path.is_some() {
            self.log_path = overrides.log_path;
        }
    }

    fn normalize(&mut self) {
        self.listen_addr = self.listen_addr.trim().to_string();
        self.upstream_url = self.upstream_url.trim().to_string();
        self.api_key = self
            .api_key
            .take()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
    }

    fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "listen_addr '{}' must be a numeric ip:port (e.g. 0.0.0.0:3001)",
                    self.listen_addr
                )
            })?;
        validate_ws_url(&self.upstream_url).context("upstream_url")?;
        if self.api_key.is_none() {
            anyhow::bail!("api_key is required (config file, --api-key or GEMINI_API_KEY)");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        if self.max_pending_messages == Some(0) {
            anyhow::bail!("max_pending_messages must be greater than zero when set");
        }
        Ok(())
    }

    pub fn upstream_base(&self) -> Result<Url> {
        Url::parse(&self.upstream_url).context("parse upstream_url")
    }

    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: self.connect_timeout(),
            max_pending: self.max_pending_messages,
        }
    }
}

fn validate_ws_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        anyhow::bail!("url must be ws or wss");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn write_config(dir: &str, json: &str) -> PathBuf {
        let tmp = env::temp_dir().join(dir);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, json).unwrap();
        cfg_path
    }

    #[test]
    fn load_config_from_json_with_defaults() {
        let cfg_path = write_config(
            "gemini-relay-config-test",
            r#"{
                "listen_addr": " 127.0.0.1:4001 ",
                "api_key": "abc123",
                "max_pending_messages": 64
            }"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:4001");
        assert_eq!(cfg.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(cfg.api_key(), "abc123");
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.session_settings().max_pending, Some(64));
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
    }

    #[test]
    fn overrides_win_over_file() {
        let cfg_path = write_config(
            "gemini-relay-config-test-overrides",
            r#"{
                "listen_addr": "127.0.0.1:4001",
                "upstream_url": "wss://example.com/bidi",
                "api_key": "from-file"
            }"#,
        );
        let cfg = Config::load_with_overrides(
            Some(&cfg_path),
            ConfigOverrides {
                listen_addr: Some("127.0.0.1:0".into()),
                api_key: Some("from-flag".into()),
                connect_timeout_ms: Some(2_500),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:0");
        assert_eq!(cfg.upstream_url, "wss://example.com/bidi");
        assert_eq!(cfg.api_key(), "from-flag");
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn no_file_uses_defaults_plus_overrides() {
        let cfg = Config::load_with_overrides(
            None,
            ConfigOverrides {
                api_key: Some("k".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(cfg.config_path.is_none());
        assert!(cfg.upstream_base().unwrap().scheme() == "wss");
    }

    #[test]
    fn reject_invalid_upstream_scheme() {
        let cfg_path = write_config(
            "gemini-relay-config-test-bad-url",
            r#"{
                "upstream_url": "https://example.com/bidi",
                "api_key": "k"
            }"#,
        );
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("upstream_url"));
    }

    #[test]
    fn reject_missing_api_key() {
        let err = Config::load_with_overrides(
            None,
            ConfigOverrides {
                api_key: Some("   ".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("api_key is required"));
    }

    #[test]
    fn reject_hostname_listen_addr() {
        let err = Config::load_with_overrides(
            None,
            ConfigOverrides {
                listen_addr: Some("localhost:3001".into()),
                api_key: Some("k".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("numeric ip:port"));
    }

    #[test]
    fn reject_zero_queue_cap() {
        let err = Config::load_with_overrides(
            None,
            ConfigOverrides {
                api_key: Some("k".into()),
                max_pending_messages: Some(0),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_pending_messages"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let cfg = Config {
            api_key: Some("super-secret".into()),
            ..Default::default()
        };
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("[redacted]"));
    }
}
