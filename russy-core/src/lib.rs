pub mod config;
pub mod delivery;
pub mod error;
pub mod feed;
pub mod matrix;
pub mod render;
pub mod room;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use config::{BotConfig, FeedConfig, MatrixConfig, RetrySettings, Settings};
pub use delivery::{Deliverer, RetryPolicy};
pub use error::{
    ChatError, ConfigError, DeliveryError, EntryError, FetchError, RoomError, SchedulerError,
    StateError,
};
pub use feed::{derive_identity, parse_entries, Entry, FeedSource, HttpFeedSource};
pub use matrix::{ChatClient, MatrixClient, Message};
pub use render::render_entry;
pub use room::{RoomCacheEntry, RoomResolver};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerOptions};
pub use storage::{FeedState, StateStore};
pub use worker::{order_oldest_first, CycleReport, FeedWorker, WorkerOptions, WorkerState};
