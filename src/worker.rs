//! Workers: pull a job, render it with a pooled browser, record the outcome.
use std::sync::Arc;

use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pool::ResourcePool;
use crate::queue::{Delivery, Queue};
use crate::store::JobStore;
use crate::types::job::{Job, JobUpdate};
use crate::types::states::JobStatus;

/// What became of one delivery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Rendered and stored.
    Completed { attempts: u32 },
    /// Failed transiently and was scheduled for another attempt.
    Retrying { attempts: u32, error: String },
    /// Failed with no attempts left.
    Failed { attempts: u32, error: String },
    /// Put back without using up an attempt because the engine is stopping.
    Released,
    /// The delivery was stale: the job had already moved on.
    Skipped,
}

/// Everything a worker needs, shared by all workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<JobStore>,
    pub queue: Arc<Queue>,
    pub pool: ResourcePool,
    pub config: Arc<EngineConfig>,
}

pub struct Worker {
    id: usize,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    /// Processes jobs until `cancel` fires. A job in progress when that
    /// happens is finished first.
    pub async fn run(self, cancel: CancellationToken) {
        debug!(worker = self.id, "worker started");

        loop {
            let wait = self.ctx.config.dequeue_wait;
            let delivery = select! {
                d = self.ctx.queue.dequeue(self.id, wait) => d,
                _ = cancel.cancelled() => break,
            };

            let delivery = match delivery {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(error) => {
                    error!(worker = self.id, %error, "dequeue failed");
                    continue;
                },
            };

            match self.process(delivery).await {
                Ok(Outcome::Completed { attempts }) => {
                    info!(job = %delivery.job, attempts, "job completed")
                },
                Ok(Outcome::Retrying { attempts, error }) => {
                    let job = delivery.job;
                    warn!(job = %job, attempts, %error, "job will be retried")
                },
                Ok(Outcome::Failed { attempts, error }) => {
                    error!(job = %delivery.job, attempts, %error, "job failed")
                },
                Ok(Outcome::Released | Outcome::Skipped) => {},
                Err(error) => {
                    // Leave the lease alone; when it expires the job is
                    // redelivered.
                    error!(job = %delivery.job, %error, "processing failed")
                },
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    /// Takes one delivery through the state machine and returns what came of
    /// it. The lease is acked on every path except a store failure.
    #[instrument(
        name = "job",
        skip_all,
        fields(job = %delivery.job, worker = self.id)
    )]
    pub async fn process(&self, delivery: Delivery) -> Result<Outcome> {
        let ctx = &self.ctx;

        let job = match ctx.store.transition(
            delivery.job,
            JobStatus::Pending,
            JobStatus::Active,
            JobUpdate::started(),
        ) {
            Ok(job) => job,
            Err(
                error @ (Error::StaleTransition { .. } | Error::NotFound(_)),
            ) => {
                warn!(%error, "skipping stale delivery");
                self.ack(delivery);
                return Ok(Outcome::Skipped);
            },
            Err(error) => return Err(error),
        };

        let result = self.render(&job, delivery).await;
        let attempts = job.attempts + 1;

        let (to, update, outcome) = match result {
            Ok(()) => (
                JobStatus::Completed,
                JobUpdate::finished(attempts, None),
                Outcome::Completed { attempts },
            ),
            Err(Error::ShuttingDown) => (
                JobStatus::Pending,
                JobUpdate::default(),
                Outcome::Released,
            ),
            Err(error)
                if error.is_transient() && attempts < job.max_attempts =>
            {
                let error = error.to_string();
                (
                    JobStatus::Pending,
                    JobUpdate::finished(attempts, Some(error.clone())),
                    Outcome::Retrying { attempts, error },
                )
            },
            Err(error) => {
                let error = error.to_string();
                (
                    JobStatus::Failed,
                    JobUpdate::finished(attempts, Some(error.clone())),
                    Outcome::Failed { attempts, error },
                )
            },
        };

        match ctx.store.transition(job.id, JobStatus::Active, to, update) {
            Ok(_) => {},
            Err(error @ Error::StaleTransition { .. }) => {
                // Our lease lapsed and the job was recovered underneath us.
                warn!(%error, "outcome not recorded");
                self.ack(delivery);
                return Ok(Outcome::Skipped);
            },
            Err(error) => return Err(error),
        }

        if to == JobStatus::Pending {
            let delay = match outcome {
                Outcome::Released => std::time::Duration::ZERO,
                _ => ctx.config.retry_delay,
            };
            let requeued = ctx.queue.requeue(job.id, delivery.lease, delay);
            if let Err(error) = requeued {
                // The original entry is still there once the lease lapses.
                warn!(%error, "requeue refused");
            }
        }

        self.ack(delivery);
        Ok(outcome)
    }

    /// Renders into a scratch file, then moves it into place. The browser
    /// goes back to the pool on every path out of here.
    async fn render(&self, job: &Job, delivery: Delivery) -> Result<()> {
        let ctx = &self.ctx;
        let mut browser = ctx.pool.acquire(ctx.config.acquire_timeout).await?;

        // Waiting for the browser ate into the lease.
        if let Err(error) = ctx.queue.touch(job.id, delivery.lease) {
            warn!(%error, "couldn't extend lease");
        }

        let root = &ctx.config.storage_root;
        let partial = job.id.partial_path(root);
        let deadline = ctx.config.render_timeout;

        debug!(url = %job.url, "rendering");
        let result =
            match timeout(deadline, browser.capture(&job.url, &partial)).await {
                Ok(result) => result,
                Err(_) => {
                    // The capture was dropped mid-flight; don't trust the
                    // browser with another page.
                    browser.mark_unhealthy();
                    Err(Error::RenderTimeout(deadline))
                },
            };

        let result = match result {
            Ok(()) => tokio::fs::rename(&partial, job.id.artifact_path(root))
                .await
                .map_err(|e| {
                    Error::RenderFailure(format!("storing screenshot: {e}"))
                }),
            Err(error) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(error)
            },
        };

        browser.release().await;
        result
    }

    fn ack(&self, delivery: Delivery) {
        if let Err(error) = self.ctx.queue.ack(delivery.job, delivery.lease) {
            warn!(%error, "ack refused");
        }
    }
}

/// The set of running workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(ctx: WorkerContext) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..ctx.config.workers)
            .map(|id| {
                let worker = Worker::new(id, ctx.clone());
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "workers started");
        Self { handles, cancel }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops taking new jobs and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(error) = handle.await {
                error!(%error, "worker panicked");
            }
        }
        info!("workers stopped");
    }
}
