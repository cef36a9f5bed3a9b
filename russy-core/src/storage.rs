use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StateError;

/// Delivery record of one feed.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FeedState {
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Most recently delivered identities, newest first.
    #[serde(default)]
    pub last_seen: VecDeque<String>,
}

impl FeedState {
    pub fn contains(&self, identity: &str) -> bool {
        self.last_seen.iter().any(|seen| seen == identity)
    }

    fn push_front(&mut self, identity: String) {
        self.last_seen.retain(|seen| *seen != identity);
        self.last_seen.push_front(identity);
    }

    /// Drops the oldest identities until at most `cap` remain, skipping any in
    /// `retain`. The list may stay above `cap` when `retain` is larger.
    fn trim(&mut self, cap: usize, retain: &HashSet<String>) {
        let Some(mut excess) = self.last_seen.len().checked_sub(cap) else {
            return;
        };
        let mut kept = VecDeque::with_capacity(self.last_seen.len() - excess);
        while let Some(identity) = self.last_seen.pop_back() {
            if excess > 0 && !retain.contains(&identity) {
                excess -= 1;
            } else {
                kept.push_front(identity);
            }
        }
        self.last_seen = kept;
    }
}

type StateData = BTreeMap<String, FeedState>;

/// Persistent per-feed record of delivered entry identities.
///
/// Every mutation is a serialized read-modify-write: the new state is written
/// to a temp file, synced, renamed over the state file, and only then applied
/// in memory. A failed write leaves the in-memory state untouched.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<StateData>>,
    path: Option<PathBuf>,
    cap: usize,
}

impl StateStore {
    /// A store that never touches the disk.
    pub fn in_memory(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateData::default())),
            path: None,
            cap: cap.max(1),
        }
    }

    /// Loads the store from `path`. A missing file yields an empty store.
    pub async fn load(path: impl AsRef<Path>, cap: usize) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let data = read_state(&path).await?;
        debug!(path = %path.display(), feeds = data.len(), "loaded delivery state");
        Ok(Self {
            inner: Arc::new(Mutex::new(data)),
            path: Some(path),
            cap: cap.max(1),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// True iff `identity` has not been delivered for `feed_key`.
    pub async fn is_new(&self, feed_key: &str, identity: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .get(feed_key)
            .map(|state| !state.contains(identity))
            .unwrap_or(true)
    }

    /// Whether the feed has ever been recorded.
    pub async fn has_feed(&self, feed_key: &str) -> bool {
        self.inner.lock().await.contains_key(feed_key)
    }

    pub async fn feed_state(&self, feed_key: &str) -> Option<FeedState> {
        self.inner.lock().await.get(feed_key).cloned()
    }

    pub async fn mark_delivered(&self, feed_key: &str, identity: &str) -> Result<(), StateError> {
        self.mark_delivered_retaining(feed_key, identity, &HashSet::new())
            .await
    }

    /// Marks `identity` delivered without evicting anything in `listed`, the
    /// identities the feed currently returns. Evicting those would make them
    /// look new on the next poll of an unchanged feed.
    pub async fn mark_delivered_retaining(
        &self,
        feed_key: &str,
        identity: &str,
        listed: &HashSet<String>,
    ) -> Result<(), StateError> {
        let cap = self.cap;
        self.commit(feed_key, |state| {
            state.push_front(identity.to_string());
            state.trim(cap, listed);
        })
        .await
    }

    /// Records the identities present on a feed's first successful poll so
    /// they are never posted. `identities` are expected oldest-first and are
    /// all kept, even past the cap.
    pub async fn establish_baseline<I>(&self, feed_key: &str, identities: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = String>,
    {
        let cap = self.cap;
        self.commit(feed_key, |state| {
            let mut listed = HashSet::new();
            for identity in identities {
                listed.insert(identity.clone());
                state.push_front(identity);
            }
            state.trim(cap, &listed);
            state.last_polled_at = Some(Utc::now());
        })
        .await
    }

    pub async fn record_poll(&self, feed_key: &str, at: DateTime<Utc>) -> Result<(), StateError> {
        self.commit(feed_key, |state| state.last_polled_at = Some(at))
            .await
    }

    async fn commit<F>(&self, feed_key: &str, mutate: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut FeedState),
    {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        mutate(next.entry(feed_key.to_string()).or_default());
        match &self.path {
            Some(path) => write_atomically(path, &next).await?,
            None => debug!("state store is in-memory only; skipping persist"),
        }
        *inner = next;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn read_state(path: &Path) -> Result<StateData, StateError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateData::default()),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match serde_json::from_slice::<StateData>(&bytes) {
        Ok(data) => Ok(data),
        Err(source) => {
            let tmp = tmp_path(path);
            warn!(error = %source, path = %path.display(), "failed to parse state, trying tmp fallback");
            match tokio::fs::read(&tmp).await {
                Ok(tmp_bytes) => serde_json::from_slice::<StateData>(&tmp_bytes).map_err(|_| {
                    StateError::Corrupt {
                        path: path.to_path_buf(),
                        source,
                    }
                }),
                Err(_) => Err(StateError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        }
    }
}

async fn write_atomically(path: &Path, data: &StateData) -> Result<(), StateError> {
    let persistence = |source| StateError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(data).map_err(|e| persistence(std::io::Error::other(e)))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(persistence)?;
    }
    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await.map_err(persistence)?;
    file.write_all(&bytes).await.map_err(persistence)?;
    file.sync_all().await.map_err(persistence)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(persistence)?;
    debug!(path = %path.display(), "state persisted");
    Ok(())
}
