use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use russy_core::{
    BotConfig, ChatClient, Deliverer, FeedSource, FeedWorker, HttpFeedSource, MatrixClient,
    RetryPolicy, RoomResolver, Scheduler, SchedulerOptions, StateStore, WorkerOptions,
};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "config.yaml";

/// Posts new RSS/Atom entries into Matrix rooms.
#[derive(Debug, Parser)]
#[command(name = "russy", version)]
struct Cli {
    /// Config file. Defaults to ./config.yaml, then <config dir>/russy/config.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `settings.state_file`.
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = BotConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(state_file) = cli.state_file {
        config.settings.state_file = state_file;
    }
    init_tracing(config.settings.log_file.as_deref())?;
    info!(config = %config_path.display(), feeds = config.feeds.len(), "starting russy");

    let settings = &config.settings;
    let matrix = MatrixClient::new(&config.matrix, settings.request_timeout())
        .context("building Matrix client")?;
    if let Some(password) = &config.matrix.password {
        matrix.login(password).await.context("Matrix login failed")?;
    }
    if !matrix.is_logged_in() {
        bail!("no Matrix access token available");
    }
    let chat: Arc<dyn ChatClient> = Arc::new(matrix);

    let store = StateStore::load(&settings.state_file, settings.max_seen_per_feed)
        .await
        .context("loading delivery state")?;
    let source: Arc<dyn FeedSource> = Arc::new(
        HttpFeedSource::new(settings.request_timeout()).context("building feed client")?,
    );
    let resolver = Arc::new(RoomResolver::new(chat.clone()));
    let deliverer = Arc::new(Deliverer::new(
        chat,
        resolver.clone(),
        RetryPolicy::from(settings.retry),
    ));

    let feeds = config.feed_configs();
    let rooms: BTreeSet<&str> = feeds.iter().map(|f| f.room_alias.as_str()).collect();
    let joined = resolver.warm_up(rooms.iter().copied()).await;
    info!(joined, rooms = rooms.len(), "rooms joined");

    let options = WorkerOptions::from(settings);
    let mut scheduler = Scheduler::new(SchedulerOptions::from(settings));
    for feed in &feeds {
        scheduler.add_worker(FeedWorker::new(
            feed.clone(),
            source.clone(),
            resolver.clone(),
            deliverer.clone(),
            store.clone(),
            options.clone(),
        ));
    }
    let handle = scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("interrupt received, shutting down");
    if let Err(e) = handle.shutdown().await {
        error!(error = %e, "unclean shutdown");
    }
    Ok(())
}

fn default_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    // Linux: ~/.config/russy/config.yaml
    dirs::config_dir()
        .map(|dir| dir.join("russy").join(CONFIG_FILE))
        .filter(|path| path.exists())
        .unwrap_or(local)
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let writer = std::io::stdout.and(Arc::new(file));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    }
    Ok(())
}
