use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub matrix: MatrixConfig,
    #[serde(rename = "rss")]
    pub feeds: Vec<RawFeedConfig>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub server: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

/// A feed block as written in the config file. `interval` is optional here;
/// [`BotConfig::feed_configs`] fills in the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeedConfig {
    pub name: String,
    pub feed: String,
    pub room: String,
    #[serde(default)]
    pub interval: Option<u64>,
}

/// Immutable description of one bridged feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub name: String,
    pub feed_url: String,
    pub room_alias: String,
    pub interval_seconds: u64,
}

impl FeedConfig {
    /// Key under which this feed's delivery state is persisted.
    pub fn state_key(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub state_file: PathBuf,
    pub default_interval: u64,
    pub max_seen_per_feed: usize,
    pub post_delay_ms: u64,
    pub request_timeout_seconds: u64,
    pub include_summary: bool,
    pub msgtype: String,
    pub shutdown_grace_seconds: u64,
    pub restart_cooldown_seconds: u64,
    pub log_file: Option<PathBuf>,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_total_ms: u64,
}

fn default_device_name() -> String {
    "russy".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".state.json"),
            default_interval: 3600,
            max_seen_per_feed: 200,
            post_delay_ms: 2000,
            request_timeout_seconds: 30,
            include_summary: true,
            msgtype: "m.text".to_string(),
            shutdown_grace_seconds: 10,
            restart_cooldown_seconds: 5,
            log_file: None,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_total_ms: 60_000,
        }
    }
}

impl Settings {
    pub fn post_delay(&self) -> Duration {
        Duration::from_millis(self.post_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_seconds)
    }
}

impl BotConfig {
    /// Reads, parses and validates the config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let homeserver = Url::parse(&self.matrix.server)
            .map_err(|e| invalid(format!("matrix.server `{}`: {e}", self.matrix.server)))?;
        if !matches!(homeserver.scheme(), "http" | "https") {
            return Err(invalid("matrix.server must be an http(s) URL"));
        }
        if self.matrix.username.trim().is_empty() {
            return Err(invalid("matrix.username is empty"));
        }
        match (&self.matrix.password, &self.matrix.access_token) {
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "set either matrix.password or matrix.access_token, not both",
                ))
            }
            (None, None) => {
                return Err(invalid("matrix.password or matrix.access_token is required"))
            }
            _ => {}
        }

        if self.feeds.is_empty() {
            return Err(invalid("no feeds configured under `rss`"));
        }
        if self.settings.default_interval == 0 {
            return Err(invalid("settings.default_interval must be at least 1"));
        }
        if self.settings.max_seen_per_feed == 0 {
            return Err(invalid("settings.max_seen_per_feed must be at least 1"));
        }
        if self.settings.retry.max_attempts == 0 {
            return Err(invalid("settings.retry.max_attempts must be at least 1"));
        }

        let mut names = HashSet::new();
        for feed in &self.feeds {
            let name = feed.name.trim();
            if name.is_empty() {
                return Err(invalid("feed with an empty name"));
            }
            if !names.insert(name) {
                return Err(invalid(format!("duplicate feed name `{name}`")));
            }
            let url = Url::parse(&feed.feed)
                .map_err(|e| invalid(format!("feed `{name}`: bad URL `{}`: {e}", feed.feed)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!("feed `{name}`: URL must be http(s)")));
            }
            let room_ok = (feed.room.starts_with('#') || feed.room.starts_with('!'))
                && feed.room.contains(':');
            if !room_ok {
                return Err(invalid(format!(
                    "feed `{name}`: room `{}` is neither an alias (#room:server) nor a room id (!id:server)",
                    feed.room
                )));
            }
            if feed.interval == Some(0) {
                return Err(invalid(format!("feed `{name}`: interval must be at least 1")));
            }
        }
        Ok(())
    }

    /// Resolved, immutable per-feed configs with defaults applied.
    pub fn feed_configs(&self) -> Vec<Arc<FeedConfig>> {
        self.feeds
            .iter()
            .map(|raw| {
                Arc::new(FeedConfig {
                    name: raw.name.trim().to_string(),
                    feed_url: raw.feed.clone(),
                    room_alias: raw.room.clone(),
                    interval_seconds: raw.interval.unwrap_or(self.settings.default_interval),
                })
            })
            .collect()
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
