//! Engine configuration, built once at startup and shared read-only.
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Longest any configured duration may be.
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 86400);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Attempts a job gets before it's marked failed.
    pub max_attempts: u32,
    /// Fixed delay before a transiently failed job is eligible again.
    pub retry_delay: Duration,
    /// Hard deadline for a single render.
    pub render_timeout: Duration,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Number of browser handles. One per worker unless overridden.
    pub pool_size: usize,
    /// How long a dequeued entry stays claimed before it's redelivered.
    pub lease_timeout: Duration,
    /// How long a dequeue waits for work before returning empty-handed.
    pub dequeue_wait: Duration,
    /// Upper bound on waiting for a free browser.
    pub acquire_timeout: Duration,
    /// Directory screenshots are written to as `<id>.png`.
    pub storage_root: PathBuf,
    /// Directory for the job journal; `None` keeps jobs in memory only.
    pub journal_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_delay: Duration::from_secs(5),
            render_timeout: Duration::from_secs(30),
            workers: 4,
            pool_size: 4,
            lease_timeout: Duration::from_secs(120),
            dequeue_wait: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(60),
            storage_root: PathBuf::from("screenshots"),
            journal_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("need at least one worker".into()));
        }
        if self.pool_size < self.workers {
            return Err(Error::Config(format!(
                "pool size {} is smaller than worker count {}",
                self.pool_size, self.workers
            )));
        }
        if self.render_timeout.is_zero() || self.dequeue_wait.is_zero() {
            return Err(Error::Config(
                "render timeout and dequeue wait must be non-zero".into(),
            ));
        }
        for (name, value) in [
            ("retry delay", self.retry_delay),
            ("render timeout", self.render_timeout),
            ("lease timeout", self.lease_timeout),
            ("dequeue wait", self.dequeue_wait),
            ("acquire timeout", self.acquire_timeout),
        ] {
            if value > MAX_DURATION {
                return Err(Error::Config(format!(
                    "{name} {value:?} is longer than {MAX_DURATION:?}"
                )));
            }
        }

        // A lease must outlive the longest legitimate attempt, or healthy
        // work gets redelivered underneath its worker.
        let attempt = self
            .acquire_timeout
            .checked_add(self.render_timeout)
            .ok_or_else(|| Error::Config("attempt length overflows".into()))?;
        if self.lease_timeout <= attempt {
            return Err(Error::Config(format!(
                "lease timeout {:?} must exceed acquire timeout plus render \
                 timeout ({attempt:?})",
                self.lease_timeout,
            )));
        }

        Ok(())
    }
}
