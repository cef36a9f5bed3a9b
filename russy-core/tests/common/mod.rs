#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use russy_core::{
    ChatClient, ChatError, Deliverer, Entry, FeedConfig, FeedSource, FeedWorker, FetchError,
    Message, RetryPolicy, RoomResolver, StateStore, WorkerOptions,
};

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh directory under the system temp dir.
pub fn temp_dir(label: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "russy_{label}_{}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis(),
        DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 21, 8, minute, 0).unwrap()
}

pub fn entry(id: &str, minute: Option<u32>) -> Entry {
    Entry::new(
        Some(id),
        format!("Title {id}"),
        format!("https://example.org/{id}"),
        None,
        minute.map(at),
    )
}

pub fn feed_config(name: &str, room: &str, interval_seconds: u64) -> Arc<FeedConfig> {
    Arc::new(FeedConfig {
        name: name.to_string(),
        feed_url: format!("https://example.org/{name}.xml"),
        room_alias: room.to_string(),
        interval_seconds,
    })
}

pub fn stale_room_error() -> ChatError {
    ChatError::Api {
        status: 404,
        errcode: "M_NOT_FOUND".into(),
        error: "Unknown room".into(),
    }
}

pub fn bad_gateway() -> ChatError {
    ChatError::Api {
        status: 502,
        errcode: String::new(),
        error: "Bad Gateway".into(),
    }
}

#[derive(Default)]
pub struct FakeSource {
    entries: Mutex<Vec<Entry>>,
    failing: AtomicBool,
    panic_next: AtomicBool,
    calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(entries: Vec<Entry>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(entries),
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        let source = Self::new(Vec::new());
        source.set_failing(true);
        source
    }

    pub fn set_entries(&self, entries: Vec<Entry>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for FakeSource {
    async fn fetch_entries(&self, _url: &str) -> Result<Vec<Entry>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("fake feed source blew up");
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status(reqwest::StatusCode::BAD_GATEWAY));
        }
        Ok(self.entries.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub room_id: String,
    pub txn_id: String,
    pub body: String,
}

/// In-process homeserver: aliases map to room ids, joins are idempotent,
/// sends succeed unless failures were queued.
#[derive(Default)]
pub struct FakeChat {
    aliases: Mutex<HashMap<String, String>>,
    joined: Mutex<HashSet<String>>,
    resolve_calls: AtomicUsize,
    join_calls: AtomicUsize,
    send_calls: AtomicUsize,
    attempted_txns: Mutex<Vec<String>>,
    sent: Mutex<Vec<Sent>>,
    send_failures: Mutex<VecDeque<ChatError>>,
    poisoned_bodies: Mutex<Vec<String>>,
}

impl FakeChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_alias(alias: &str, room_id: &str) -> Arc<Self> {
        let chat = Self::new();
        chat.add_alias(alias, room_id);
        chat
    }

    pub fn add_alias(&self, alias: &str, room_id: &str) {
        self.aliases
            .lock()
            .unwrap()
            .insert(alias.to_string(), room_id.to_string());
    }

    pub fn remove_alias(&self, alias: &str) {
        self.aliases.lock().unwrap().remove(alias);
    }

    /// Queue errors returned by the next sends, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = ChatError>) {
        self.send_failures.lock().unwrap().extend(errors);
    }

    /// Every send whose body contains `needle` fails terminally.
    pub fn poison(&self, needle: &str) {
        self.poisoned_bodies.lock().unwrap().push(needle.to_string());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.body).collect()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Transaction ids of every send attempt, failed ones included.
    pub fn attempted_txns(&self) -> Vec<String> {
        self.attempted_txns.lock().unwrap().clone()
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.joined.lock().unwrap().contains(room_id)
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn resolve_alias(&self, alias: &str) -> Result<String, ChatError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.aliases
            .lock()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| ChatError::Api {
                status: 404,
                errcode: "M_NOT_FOUND".into(),
                error: format!("Room alias {alias} not found"),
            })
    }

    async fn join_room(&self, room_id: &str) -> Result<(), ChatError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        self.joined.lock().unwrap().insert(room_id.to_string());
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        txn_id: &str,
        message: &Message,
    ) -> Result<(), ChatError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.attempted_txns.lock().unwrap().push(txn_id.to_string());
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let poisoned = self
            .poisoned_bodies
            .lock()
            .unwrap()
            .iter()
            .any(|needle| message.body.contains(needle.as_str()));
        if poisoned {
            return Err(ChatError::Api {
                status: 400,
                errcode: "M_BAD_JSON".into(),
                error: "poisoned".into(),
            });
        }
        self.sent.lock().unwrap().push(Sent {
            room_id: room_id.to_string(),
            txn_id: txn_id.to_string(),
            body: message.body.clone(),
        });
        Ok(())
    }
}

/// Retries immediately so tests on the real clock stay fast.
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::ZERO,
        max_total: Duration::from_secs(5),
    }
}

pub fn quiet_options() -> WorkerOptions {
    WorkerOptions {
        post_delay: Duration::ZERO,
        ..WorkerOptions::default()
    }
}

pub fn worker(
    feed: Arc<FeedConfig>,
    source: Arc<FakeSource>,
    chat: Arc<FakeChat>,
    store: StateStore,
) -> FeedWorker {
    let resolver = Arc::new(RoomResolver::new(chat.clone()));
    let deliverer = Arc::new(Deliverer::new(chat, resolver.clone(), quick_retry()));
    FeedWorker::new(feed, source, resolver, deliverer, store, quiet_options())
}
