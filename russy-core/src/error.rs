use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error("feed is neither RSS ({rss}) nor Atom ({atom})")]
    Parse { rss: String, atom: String },
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("rate limited by homeserver")]
    RateLimited { retry_after: Option<Duration> },
    #[error("homeserver returned {status} {errcode}: {error}")]
    Api {
        status: u16,
        errcode: String,
        error: String,
    },
    #[error("malformed homeserver response: {0}")]
    Malformed(String),
    #[error("client has no access token")]
    NotLoggedIn,
}

impl ChatError {
    /// Errors worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Network(_) | ChatError::RateLimited { .. } => true,
            ChatError::Api { status, .. } => *status >= 500,
            ChatError::Malformed(_) | ChatError::NotLoggedIn => false,
        }
    }

    /// The cached room id can no longer be used and the alias must be resolved again.
    pub fn indicates_stale_room(&self) -> bool {
        match self {
            ChatError::Api {
                status, errcode, ..
            } => {
                matches!(errcode.as_str(), "M_NOT_FOUND" | "M_FORBIDDEN")
                    || *status == 403
                    || *status == 404
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {alias} is unresolvable: {source}")]
    Unresolvable {
        alias: String,
        #[source]
        source: ChatError,
    },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery to {room_id} failed after {attempts} attempt(s): {source}")]
    Failed {
        room_id: String,
        attempts: u32,
        #[source]
        source: ChatError,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to persist state to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} and its temp copy are both unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot read state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single entry could not be posted during a cycle.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("feed supervisor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
