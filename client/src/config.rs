use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::sync::backoff::ReconnectPolicy;
use crate::sync::channel::ChannelOptions;
use crate::sync::identity::{Identity, Role};
use crate::sync::machine::DEFAULT_PENDING_LIMIT;

/// Top-level watcher configuration, loaded from roster.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WatchConfig {
    pub channel: ChannelSection,
    pub reconnect: ReconnectSection,
    pub logging: LoggingSection,
    /// Where the file-level values came from. Set by `load`.
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Config is loaded before logging is up, so `load` records this for the
/// caller to log afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    File,
    #[default]
    Defaults,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Roster server URL (ws:// or wss://).
    pub endpoint: String,
    /// "admin" or "teacher".
    pub role: String,
    pub id: String,
    pub connect_timeout_ms: u64,
    /// Deltas buffered while waiting for the initial snapshot.
    pub pending_limit: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws/roster".into(),
            role: "teacher".into(),
            id: String::new(),
            connect_timeout_ms: 10_000,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    /// Omit for unlimited retries.
    pub max_attempts: Option<u32>,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// tracing-subscriber filter used when RUST_LOG is unset.
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl WatchConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            let mut config = Self::parse(&contents)
                .with_context(|| format!("failed to parse config file {path}"))?;
            config.source = ConfigSource::File;
            config
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROSTER_ENDPOINT") {
            self.channel.endpoint = v;
        }
        if let Some(v) = var("ROSTER_ROLE") {
            self.channel.role = v;
        }
        if let Some(v) = var("ROSTER_ID") {
            self.channel.id = v;
        }
        if let Some(v) = var("ROSTER_CONNECT_TIMEOUT_MS")
            && let Ok(ms) = v.parse()
        {
            self.channel.connect_timeout_ms = ms;
        }
        if let Some(v) = var("RECONNECT_MAX_ATTEMPTS") {
            // Empty or "unlimited" clears the cap
            if v.is_empty() || v.eq_ignore_ascii_case("unlimited") {
                self.reconnect.max_attempts = None;
            } else if let Ok(n) = v.parse() {
                self.reconnect.max_attempts = Some(n);
            }
        }
        if let Some(v) = var("RECONNECT_BASE_DELAY_MS")
            && let Ok(ms) = v.parse()
        {
            self.reconnect.base_delay_ms = ms;
        }
        if let Some(v) = var("RECONNECT_MAX_DELAY_MS")
            && let Ok(ms) = v.parse()
        {
            self.reconnect.max_delay_ms = ms;
        }
        if let Some(v) = var("RECONNECT_MULTIPLIER")
            && let Ok(m) = v.parse()
        {
            self.reconnect.multiplier = m;
        }
        if let Some(v) = var("LOG_FILTER") {
            self.logging.filter = v;
        }
    }

    /// Build the identity this watcher connects as.
    pub fn identity(&self) -> Result<Identity> {
        let role: Role = self.channel.role.parse().map_err(|e: String| anyhow!(e))?;
        Ok(Identity::new(role, self.channel.id.clone())?)
    }

    /// Convert into channel options for the sync layer.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                multiplier: self.reconnect.multiplier,
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                jitter: self.reconnect.jitter,
            },
            connect_timeout: Duration::from_millis(self.channel.connect_timeout_ms),
            pending_limit: self.channel.pending_limit,
        }
    }
}
