use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::RoomError;
use crate::matrix::ChatClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomCacheEntry {
    pub room_id: String,
    pub resolved_at: DateTime<Utc>,
    pub stale: bool,
}

/// Maps configured room aliases to joined room ids.
///
/// The cache lives for the whole process. Entries are only marked stale,
/// never removed, so the next [`resolve`](Self::resolve) resolves and joins again.
pub struct RoomResolver {
    client: Arc<dyn ChatClient>,
    cache: RwLock<HashMap<String, RoomCacheEntry>>,
}

impl RoomResolver {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the room id for `alias`, resolving and joining on a cache miss.
    ///
    /// A value starting with `!` is already a room id and is only joined.
    /// Failures are not retried here.
    pub async fn resolve(&self, alias: &str) -> Result<String, RoomError> {
        if let Some(entry) = self.cache.read().await.get(alias).filter(|e| !e.stale) {
            return Ok(entry.room_id.clone());
        }

        let unresolvable = |source| RoomError::Unresolvable {
            alias: alias.to_string(),
            source,
        };
        let room_id = if alias.starts_with('!') {
            alias.to_string()
        } else {
            self.client.resolve_alias(alias).await.map_err(unresolvable)?
        };
        self.client.join_room(&room_id).await.map_err(unresolvable)?;

        info!(alias, room_id = %room_id, "joined room");
        self.cache.write().await.insert(
            alias.to_string(),
            RoomCacheEntry {
                room_id: room_id.clone(),
                resolved_at: Utc::now(),
                stale: false,
            },
        );
        Ok(room_id)
    }

    /// Marks every alias pointing at `room_id` as stale. Returns how many were marked.
    pub async fn invalidate_room(&self, room_id: &str) -> usize {
        let mut cache = self.cache.write().await;
        let mut marked = 0;
        for (alias, entry) in cache.iter_mut() {
            if entry.room_id == room_id && !entry.stale {
                entry.stale = true;
                marked += 1;
                warn!(alias = %alias, room_id, "room cache entry invalidated");
            }
        }
        marked
    }

    pub async fn invalidate_alias(&self, alias: &str) {
        if let Some(entry) = self.cache.write().await.get_mut(alias) {
            debug!(alias, "room cache entry invalidated");
            entry.stale = true;
        }
    }

    pub async fn cached(&self, alias: &str) -> Option<RoomCacheEntry> {
        self.cache.read().await.get(alias).cloned()
    }

    /// Resolves and joins every alias once, logging failures.
    pub async fn warm_up<'a, I>(&self, aliases: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut joined = 0;
        for alias in aliases {
            match self.resolve(alias).await {
                Ok(_) => joined += 1,
                Err(e) => warn!(alias, error = %e, "could not join room at startup"),
            }
        }
        joined
    }
}
