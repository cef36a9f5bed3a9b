use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{FeedConfig, Settings};
use crate::delivery::Deliverer;
use crate::error::{EntryError, StateError};
use crate::feed::{Entry, FeedSource};
use crate::render::render_entry;
use crate::room::RoomResolver;
use crate::storage::StateStore;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Filtering,
    Delivering,
    Stopped,
}

/// What happened during one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub new: usize,
    pub delivered: usize,
    pub failed: usize,
    pub fetch_failed: bool,
    pub baseline: bool,
    /// Stopped early, either on shutdown or because state could not be persisted.
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub msgtype: String,
    pub include_summary: bool,
    /// Pause between consecutive posts of one cycle.
    pub post_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for WorkerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            msgtype: settings.msgtype.clone(),
            include_summary: settings.include_summary,
            post_delay: settings.post_delay(),
        }
    }
}

/// Runs the fetch, filter, deliver cycle for a single feed.
#[derive(Clone)]
pub struct FeedWorker {
    feed: Arc<FeedConfig>,
    source: Arc<dyn FeedSource>,
    resolver: Arc<RoomResolver>,
    deliverer: Arc<Deliverer>,
    store: StateStore,
    options: Arc<WorkerOptions>,
    status: Arc<watch::Sender<WorkerState>>,
}

impl FeedWorker {
    pub fn new(
        feed: Arc<FeedConfig>,
        source: Arc<dyn FeedSource>,
        resolver: Arc<RoomResolver>,
        deliverer: Arc<Deliverer>,
        store: StateStore,
        options: WorkerOptions,
    ) -> Self {
        let (status, _) = watch::channel(WorkerState::Idle);
        Self {
            feed,
            source,
            resolver,
            deliverer,
            store,
            options: Arc::new(options),
            status: Arc::new(status),
        }
    }

    pub fn feed(&self) -> &FeedConfig {
        &self.feed
    }

    pub fn state(&self) -> WorkerState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.status.subscribe()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.status.send_replace(state);
    }

    /// Polls immediately, then once per interval, until `shutdown` turns true
    /// or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let feed = self.feed.name.as_str();
        info!(feed, interval_secs = self.feed.interval_seconds, room = %self.feed.room_alias, "feed worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.cycle(Some(&shutdown)).await;
            debug!(
                feed,
                fetched = report.fetched,
                new = report.new,
                delivered = report.delivered,
                failed = report.failed,
                "poll cycle finished"
            );

            debug!(feed, wait_secs = self.feed.interval_seconds, "waiting for next poll");
            let stop = tokio::select! {
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                _ = tokio::time::sleep(self.feed.interval()) => false,
            };
            if stop {
                break;
            }
        }

        self.set_state(WorkerState::Stopped);
        info!(feed, "feed worker stopped");
    }

    /// Runs a single cycle without shutdown checks.
    pub async fn poll_once(&self) -> CycleReport {
        self.cycle(None).await
    }

    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> CycleReport {
        let feed = self.feed.name.as_str();
        let key = self.feed.state_key();
        let mut report = CycleReport::default();

        self.set_state(WorkerState::Fetching);
        debug!(feed, url = %self.feed.feed_url, "fetching feed");
        let entries = match self.source.fetch_entries(&self.feed.feed_url).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(feed, url = %self.feed.feed_url, error = %e, "failed to fetch feed");
                report.fetch_failed = true;
                self.set_state(WorkerState::Idle);
                return report;
            }
        };
        report.fetched = entries.len();
        if entries.len() > self.store.cap() {
            debug!(
                feed,
                fetched = entries.len(),
                cap = self.store.cap(),
                "feed lists more entries than the seen cap, keeping all listed identities"
            );
        }
        let listed: HashSet<String> = entries.iter().map(|e| e.identity.clone()).collect();

        self.set_state(WorkerState::Filtering);
        let first_poll = !self.store.has_feed(key).await;
        let mut fresh: Vec<Entry> = Vec::new();
        for entry in entries {
            if fresh.iter().any(|e| e.identity == entry.identity) {
                continue;
            }
            if self.store.is_new(key, &entry.identity).await {
                fresh.push(entry);
            }
        }
        order_oldest_first(&mut fresh);

        if first_poll {
            let count = fresh.len();
            match self
                .store
                .establish_baseline(key, fresh.into_iter().map(|e| e.identity))
                .await
            {
                Ok(()) => info!(feed, entries = count, "first poll, recorded baseline without posting"),
                Err(e) => error!(feed, error = %e, "failed to persist baseline"),
            }
            report.baseline = true;
            self.set_state(WorkerState::Idle);
            return report;
        }

        if let Err(e) = self.store.record_poll(key, Utc::now()).await {
            warn!(feed, error = %e, "failed to record poll time");
        }
        report.new = fresh.len();
        if fresh.is_empty() {
            self.set_state(WorkerState::Idle);
            return report;
        }

        info!(feed, new = fresh.len(), "new entries found");
        self.set_state(WorkerState::Delivering);
        for (index, entry) in fresh.iter().enumerate() {
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                info!(feed, remaining = fresh.len() - index, "shutdown requested, leaving entries for next run");
                report.interrupted = true;
                break;
            }
            if index > 0 && !self.options.post_delay.is_zero() {
                tokio::time::sleep(self.options.post_delay).await;
            }

            if let Err(e) = self.deliver(entry).await {
                warn!(feed, entry = %entry.identity, error = %e, "delivery failed, will retry next poll");
                report.failed += 1;
                continue;
            }
            report.delivered += 1;

            if let Err(e) = self.persist_delivery(&entry.identity, &listed).await {
                error!(
                    feed,
                    entry = %entry.identity,
                    error = %e,
                    "delivered but could not persist; stopping cycle, entry may be posted again"
                );
                report.interrupted = true;
                break;
            }
        }

        self.set_state(WorkerState::Idle);
        report
    }

    async fn deliver(&self, entry: &Entry) -> Result<(), EntryError> {
        let room_id = self.resolver.resolve(&self.feed.room_alias).await?;
        let message = render_entry(entry, &self.options.msgtype, self.options.include_summary);
        info!(feed = %self.feed.name, room_id = %room_id, title = %entry.title, "posting entry");
        self.deliverer.send(&room_id, &message).await?;
        Ok(())
    }

    async fn persist_delivery(&self, identity: &str, listed: &HashSet<String>) -> Result<(), StateError> {
        let key = self.feed.state_key();
        let mut attempt = 1;
        loop {
            match self.store.mark_delivered_retaining(key, identity, listed).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(feed = %self.feed.name, attempt, error = %e, "persisting delivery failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sorts ascending by publication time. Undated entries go last and keep feed order.
pub fn order_oldest_first(entries: &mut [Entry]) {
    entries.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
