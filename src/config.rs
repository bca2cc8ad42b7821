use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::rules::RuleConfig;

/// Configuration of the public rendezvous peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long a request may wait for an idle tunnel, in milliseconds.
    /// Zero disables the bound.
    pub timeout_ms: u64,
    /// How long a surplus tunnel may sit idle before the GC closes it,
    /// in milliseconds.
    pub idle_timeout_ms: u64,
    pub whitelist: Vec<RuleConfig>,
    pub blacklist: Vec<RuleConfig>,
    /// Shared secret expected in X-SECRET-KEY on /register. Empty means
    /// no secret required.
    pub secret_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout_ms: 1000,
            idle_timeout_ms: 60_000,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            secret_key: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration of the internal tunnel peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Instance ID. Groups every tunnel of this process into one
    /// server-side pool. Generated if left empty.
    pub id: String,
    /// Display name advertised to the server. Defaults to the hostname.
    pub name: String,
    /// Rendezvous registration endpoints (`ws[s]://host:port/register`).
    pub targets: Vec<String>,
    /// Number of idle tunnels to maintain per target.
    pub pool_idle_size: usize,
    /// Hard cap on simultaneous tunnels per target.
    pub pool_max_size: usize,
    pub whitelist: Vec<RuleConfig>,
    pub blacklist: Vec<RuleConfig>,
    pub secret_key: String,
    /// Skip TLS certificate verification when dialing wss:// targets and
    /// executing https:// requests.
    pub insecure_skip_verify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: gethostname::gethostname().to_string_lossy().into_owned(),
            targets: vec!["ws://127.0.0.1:8080/register".to_string()],
            pool_idle_size: 10,
            pool_max_size: 100,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            secret_key: String::new(),
            insecure_skip_verify: false,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        if config.id.is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }
        Ok(config)
    }
}

fn load_toml<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config file: {path:?}"))
}
