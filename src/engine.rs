//! Wires the store, queue, browser pool and workers together and owns their
//! lifecycle.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::browser::BrowserFactory;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pool::{PoolStats, ResourcePool};
use crate::queue::{Queue, QueueStats};
use crate::store::{JobStore, StatusCounts};
use crate::types::job::{Job, JobEvent, JobId};
use crate::worker::{WorkerContext, WorkerPool};

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub jobs: StatusCounts,
    #[serde(flatten)]
    pub queue: QueueStats,
    #[serde(flatten)]
    pub pool: PoolStats,
    /// number of worker tasks
    pub workers: u64,
    /// attempts each job gets
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    /// records written to the job journal since startup, if enabled
    #[serde(rename = "journal-records-written")]
    pub journal_records: Option<u64>,
    /// is the engine refusing new jobs
    pub draining: bool,
    /// number of seconds since the engine started
    pub uptime: u64,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<JobStore>,
    queue: Arc<Queue>,
    pool: ResourcePool,
    workers: Mutex<Option<WorkerPool>>,
    worker_count: usize,
    draining: AtomicBool,
    drain_requested: CancellationToken,
    started: Instant,
}

impl Engine {
    /// Opens the store, restores outstanding work, warms up the browser pool
    /// and starts the workers.
    pub async fn start(
        config: EngineConfig,
        factory: Box<dyn BrowserFactory>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.storage_root).await?;

        let store = Arc::new(match &config.journal_dir {
            Some(dir) => JobStore::open(dir, config.max_attempts)?,
            None => JobStore::in_memory(config.max_attempts),
        });
        let queue = Arc::new(Queue::new(store.clone(), config.lease_timeout));
        let restored = queue.recover()?;

        let pool = ResourcePool::new(factory, config.pool_size);
        pool.warm_up().await?;

        let config = Arc::new(config);
        let workers = WorkerPool::spawn(WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            pool: pool.clone(),
            config: config.clone(),
        });

        info!(
            workers = workers.len(),
            pool = config.pool_size,
            restored,
            storage = %config.storage_root.display(),
            "engine started"
        );

        Ok(Self {
            worker_count: workers.len(),
            config,
            store,
            queue,
            pool,
            workers: Mutex::new(Some(workers)),
            draining: AtomicBool::new(false),
            drain_requested: CancellationToken::new(),
            started: Instant::now(),
        })
    }

    /// Admits a job for `url`, returning its id.
    pub fn enqueue(&self, url: &str) -> Result<JobId> {
        if self.is_draining() {
            return Err(Error::ShuttingDown);
        }
        let id = self.store.create(url)?;
        self.queue.enqueue(id);
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.store.get(id)
    }

    /// Where the screenshot for `id` is (or will be) written.
    pub fn artifact_path(&self, id: JobId) -> PathBuf {
        id.artifact_path(&self.config.storage_root)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.store.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            jobs: self.store.counts(),
            queue: self.queue.stats(),
            pool: self.pool.stats(),
            workers: self.worker_count as u64,
            max_attempts: self.config.max_attempts,
            journal_records: self.store.journal_records(),
            draining: self.is_draining(),
            uptime: self.started.elapsed().as_secs(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stops admitting jobs and signals whoever owns the engine to shut it
    /// down. Returns false if a drain was already under way.
    pub fn drain(&self) -> bool {
        let first = !self.draining.swap(true, Ordering::SeqCst);
        if first {
            info!("drain requested");
        }
        self.drain_requested.cancel();
        first
    }

    /// Fires once `drain` has been called.
    pub fn drain_requested(&self) -> CancellationToken {
        self.drain_requested.clone()
    }

    /// Lets in-flight jobs finish, stops the workers and closes every
    /// browser. Jobs still queued stay pending for the next start.
    pub async fn shutdown(&self) {
        self.drain();

        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workers) = workers {
            self.queue.wake_all();
            workers.shutdown().await;
        }
        self.pool.shutdown().await;

        info!(stats = ?self.store.counts(), "engine stopped");
    }
}
