use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::FetchError;

const USER_AGENT: &str = concat!("russy/", env!("CARGO_PKG_VERSION"), " (RSS to Matrix bridge)");

/// One syndicated item from a single fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub identity: String,
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// Builds an entry, deriving its identity from the feed-provided id,
    /// the link, or a digest of title and link, in that order.
    pub fn new(
        feed_id: Option<&str>,
        title: impl Into<String>,
        link: impl Into<String>,
        summary: Option<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Self {
        let title = title.into();
        let link = link.into();
        Self {
            identity: derive_identity(feed_id, &link, &title),
            title,
            link,
            summary,
            published_at,
        }
    }

    pub fn from_rss_item(item: &rss::Item) -> Self {
        let published_at = item.pub_date().and_then(parse_date);
        Self::new(
            item.guid().map(|guid| guid.value()),
            item.title().unwrap_or_default(),
            item.link().unwrap_or_default(),
            item.description().map(ToOwned::to_owned),
            published_at,
        )
    }

    pub fn from_atom_entry(entry: &atom_syndication::Entry) -> Self {
        // Prefer the alternate link, then whatever comes first.
        let link = entry
            .links()
            .iter()
            .find(|link| link.rel() == "alternate")
            .or_else(|| entry.links().first())
            .map(|link| link.href().to_string())
            .unwrap_or_default();
        let summary = entry
            .summary()
            .map(|text| text.value.clone())
            .or_else(|| entry.content().and_then(|c| c.value().map(ToOwned::to_owned)));
        let published_at = entry
            .published()
            .copied()
            .unwrap_or_else(|| *entry.updated())
            .with_timezone(&Utc);
        Self::new(
            Some(entry.id()),
            entry.title().value.clone(),
            link,
            summary,
            Some(published_at),
        )
    }
}

/// Stable de-duplication key for an entry.
pub fn derive_identity(feed_id: Option<&str>, link: &str, title: &str) -> String {
    if let Some(id) = feed_id.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let link = link.trim();
    if !link.is_empty() {
        return link.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0x1f_u8]);
    hasher.update(link.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses an RSS 2.0 document, falling back to Atom. Entries keep document order.
pub fn parse_entries(bytes: &[u8]) -> Result<Vec<Entry>, FetchError> {
    let rss_err = match rss::Channel::read_from(Cursor::new(bytes)) {
        Ok(channel) => return Ok(channel.items().iter().map(Entry::from_rss_item).collect()),
        Err(e) => e,
    };
    match atom_syndication::Feed::read_from(Cursor::new(bytes)) {
        Ok(feed) => Ok(feed.entries().iter().map(Entry::from_atom_entry).collect()),
        Err(atom_err) => Err(FetchError::Parse {
            rss: rss_err.to_string(),
            atom: atom_err.to_string(),
        }),
    }
}

/// Source of feed entries, one call per poll cycle.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_entries(&self, url: &str) -> Result<Vec<Entry>, FetchError>;
}

/// Fetches feeds over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: Client,
}

impl HttpFeedSource {
    pub fn new(request_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_entries(&self, url: &str) -> Result<Vec<Entry>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let bytes = response.bytes().await?;
        let entries = parse_entries(&bytes)?;
        debug!(url, count = entries.len(), "fetched feed");
        Ok(entries)
    }
}
