//! Configuration resolution for the Pusher gateway.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global settings (`<config dir>/pusher/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. `PUSHER_*` environment variables
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Production APNS endpoint.
pub const PRODUCTION_URL: &str = "https://api.push.apple.com";
/// Development (sandbox) APNS endpoint.
pub const SANDBOX_URL: &str = "https://api.development.push.apple.com";

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP surface listens on.
    pub listen_addr: String,
    /// Token store database file.
    pub database_path: PathBuf,
    /// Credential snapshot file, rewritten after every registry change.
    pub snapshot_path: PathBuf,
    /// Delivery workers per registered identity.
    pub workers: usize,
    /// Per-request timeout for outbound APNS calls, in seconds.
    pub request_timeout_secs: u64,
    pub production_url: String,
    pub sandbox_url: String,
    /// Speak HTTP/2 without ALPN negotiation (plain-text test endpoints).
    pub http2_prior_knowledge: bool,
    pub log_json: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            database_path: data_dir().join("tokens.db"),
            snapshot_path: data_dir().join("credentials.json"),
            workers: 2,
            request_timeout_secs: 15,
            production_url: PRODUCTION_URL.to_string(),
            sandbox_url: SANDBOX_URL.to_string(),
            http2_prior_knowledge: false,
            log_json: false,
        }
    }
}

impl GatewayConfig {
    /// Outbound request timeout as a `Duration`.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Clamp values that have a floor.
    fn normalize(&mut self) {
        self.workers = self.workers.max(1);
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = 15;
        }
    }
}

/// A partially specified configuration, as read from a settings file.
///
/// Unset fields leave the lower layer untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigLayer {
    listen_addr: Option<String>,
    database_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    workers: Option<usize>,
    request_timeout_secs: Option<u64>,
    production_url: Option<String>,
    sandbox_url: Option<String>,
    http2_prior_knowledge: Option<bool>,
    log_json: Option<bool>,
}

impl ConfigLayer {
    fn apply(self, config: &mut GatewayConfig) {
        if let Some(v) = self.listen_addr {
            config.listen_addr = v;
        }
        if let Some(v) = self.database_path {
            config.database_path = v;
        }
        if let Some(v) = self.snapshot_path {
            config.snapshot_path = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.request_timeout_secs {
            config.request_timeout_secs = v;
        }
        if let Some(v) = self.production_url {
            config.production_url = v;
        }
        if let Some(v) = self.sandbox_url {
            config.sandbox_url = v;
        }
        if let Some(v) = self.http2_prior_knowledge {
            config.http2_prior_knowledge = v;
        }
        if let Some(v) = self.log_json {
            config.log_json = v;
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is the `--config` file; unlike the global settings file it
/// must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<GatewayConfig> {
    load_config_from(global_config_path().as_deref(), explicit, |key| {
        std::env::var(key).ok()
    })
}

/// Resolution with injectable sources, used by [`load_config`] and tests.
pub fn load_config_from(
    global: Option<&Path>,
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::default();

    if let Some(path) = global.filter(|p| p.exists()) {
        load_config_file(path)?.apply(&mut config);
    }
    if let Some(path) = explicit {
        load_config_file(path)?.apply(&mut config);
    }
    apply_env_overrides(&mut config, env)?;

    config.normalize();
    Ok(config)
}

/// Path of the global settings file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("pusher").join("settings.json"))
}

/// Directory holding the token database and credential snapshot by default.
fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pusher")
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {value:?}")))
}

fn apply_env_overrides(
    config: &mut GatewayConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = env("PUSHER_LISTEN") {
        config.listen_addr = val;
    }
    if let Some(val) = env("PUSHER_DATABASE") {
        config.database_path = PathBuf::from(val);
    }
    if let Some(val) = env("PUSHER_SNAPSHOT") {
        config.snapshot_path = PathBuf::from(val);
    }
    if let Some(val) = env("PUSHER_WORKERS") {
        config.workers = parse_env("PUSHER_WORKERS", &val)?;
    }
    if let Some(val) = env("PUSHER_TIMEOUT_SECS") {
        config.request_timeout_secs = parse_env("PUSHER_TIMEOUT_SECS", &val)?;
    }
    if let Some(val) = env("PUSHER_PRODUCTION_URL") {
        config.production_url = val;
    }
    if let Some(val) = env("PUSHER_SANDBOX_URL") {
        config.sandbox_url = val;
    }
    if let Some(val) = env("PUSHER_HTTP2_PRIOR_KNOWLEDGE") {
        config.http2_prior_knowledge = parse_env("PUSHER_HTTP2_PRIOR_KNOWLEDGE", &val)?;
    }
    if let Some(val) = env("PUSHER_LOG_JSON") {
        config.log_json = parse_env("PUSHER_LOG_JSON", &val)?;
    }
    Ok(())
}
