use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::SchedulerError;
use crate::worker::{FeedWorker, WorkerState};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Wait before restarting a worker that panicked.
    pub restart_cooldown: Duration,
    /// How long an in-flight cycle may keep running after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SchedulerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            restart_cooldown: settings.restart_cooldown(),
            shutdown_grace: settings.shutdown_grace(),
        }
    }
}

/// Owns the feed workers. Each one runs in its own task under a supervisor
/// that restarts it after a panic.
pub struct Scheduler {
    workers: Vec<FeedWorker>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            workers: Vec::new(),
            options,
        }
    }

    pub fn with_worker(mut self, worker: FeedWorker) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn add_worker(&mut self, worker: FeedWorker) {
        self.workers.push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawns every worker. Must be called inside a Tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisors = Vec::with_capacity(self.workers.len());
        let mut states = Vec::with_capacity(self.workers.len());

        for worker in self.workers {
            let name = worker.feed().name.clone();
            states.push((name.clone(), worker.subscribe()));
            let join = tokio::spawn(supervise(worker, shutdown_rx.clone(), self.options));
            supervisors.push((name, join));
        }
        info!(workers = supervisors.len(), "scheduler started");

        SchedulerHandle {
            shutdown_tx,
            supervisors,
            states,
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    supervisors: Vec<(String, JoinHandle<()>)>,
    states: Vec<(String, watch::Receiver<WorkerState>)>,
}

impl SchedulerHandle {
    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        self.states
            .iter()
            .map(|(name, rx)| (name.clone(), *rx.borrow()))
            .collect()
    }

    /// Cancels every timer and waits for the workers, each bounded by the grace period.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        info!("scheduler shutdown requested");
        self.shutdown_tx.send_replace(true);
        let mut result = Ok(());
        for (name, join) in self.supervisors {
            if let Err(e) = join.await {
                error!(feed = %name, error = %e, "supervisor task failed");
                result = Err(SchedulerError::from(e));
            }
        }
        info!("scheduler stopped");
        result
    }
}

async fn supervise(worker: FeedWorker, mut shutdown: watch::Receiver<bool>, options: SchedulerOptions) {
    let feed = worker.feed().name.clone();
    let mut restarts: u32 = 0;

    loop {
        let mut task = tokio::spawn(worker.clone().run(shutdown.clone()));
        let finished = tokio::select! {
            res = &mut task => Some(res),
            _ = shutdown_requested(&mut shutdown) => None,
        };

        match finished {
            None => {
                if tokio::time::timeout(options.shutdown_grace, &mut task).await.is_err() {
                    warn!(feed = %feed, grace_secs = options.shutdown_grace.as_secs(), "worker did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                    worker.set_state(WorkerState::Stopped);
                }
                break;
            }
            Some(Ok(())) => break,
            Some(Err(e)) if e.is_panic() => {
                restarts += 1;
                worker.set_state(WorkerState::Idle);
                error!(
                    feed = %feed,
                    restarts,
                    cooldown_secs = options.restart_cooldown.as_secs(),
                    "feed worker crashed, restarting after cooldown"
                );
                let stop = tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => true,
                    _ = tokio::time::sleep(options.restart_cooldown) => false,
                };
                if stop {
                    worker.set_state(WorkerState::Stopped);
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(feed = %feed, error = %e, "feed worker cancelled");
                break;
            }
        }
    }
}

/// Completes once shutdown is signalled or the scheduler handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
