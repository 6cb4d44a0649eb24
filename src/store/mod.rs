//! The job store: the source of truth for which jobs exist and what state
//! they're in.
//!
//! Every mutation happens under a single lock that's never held across an
//! await point. When a journal is configured, a mutation is only applied in
//! memory once its record has been written.
mod journal;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};
use url::Url;

use self::journal::Journal;
use crate::error::{Error, Result};
use crate::types::job::{Job, JobEvent, JobId, JobUpdate};
use crate::types::states::JobStatus;

const EVENT_CAPACITY: usize = 1024;

pub struct JobStore {
    inner: Mutex<Inner>,
    max_attempts: u32,
    events: broadcast::Sender<JobEvent>,
}

struct Inner {
    jobs: HashMap<JobId, Job>,
    next_id: u64,
    journal: Option<Journal>,
}

/// Number of jobs in each state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatusCounts {
    #[serde(rename = "current-jobs-pending")]
    pub pending: u64,
    #[serde(rename = "current-jobs-active")]
    pub active: u64,
    #[serde(rename = "current-jobs-completed")]
    pub completed: u64,
    #[serde(rename = "current-jobs-failed")]
    pub failed: u64,
}

impl JobStore {
    /// A store that forgets everything when the process exits.
    pub fn in_memory(max_attempts: u32) -> Self {
        Self::from_parts(HashMap::new(), 1, None, max_attempts)
    }

    /// A store backed by a journal in `dir`, restoring any jobs recorded
    /// there by a previous run.
    pub fn open(dir: &Path, max_attempts: u32) -> Result<Self> {
        let (journal, jobs) = Journal::open(dir)?;
        let next_id = jobs.iter().map(|j| j.id.0).max().unwrap_or(0) + 1;

        info!(
            path = %journal.path().display(),
            jobs = jobs.len(),
            next_id,
            "restored job store"
        );

        let jobs = jobs.into_iter().map(|j| (j.id, j)).collect();
        Ok(Self::from_parts(jobs, next_id, Some(journal), max_attempts))
    }

    fn from_parts(
        jobs: HashMap<JobId, Job>,
        next_id: u64,
        journal: Option<Journal>,
        max_attempts: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                jobs,
                next_id,
                journal,
            }),
            max_attempts,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Mutations are applied with a single assignment after all fallible
        // work, so a poisoned lock still guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates `url` and records a new pending job for it.
    pub fn create(&self, url: &str) -> Result<JobId> {
        let url = parse_target(url)?;

        let job = {
            let mut inner = self.lock();
            let id = JobId(inner.next_id);
            let job = Job::new(id, url, self.max_attempts);
            if let Some(journal) = inner.journal.as_mut() {
                journal.append(&job)?;
            }
            inner.next_id += 1;
            inner.jobs.insert(id, job.clone());
            job
        };

        debug!(job = %job.id, url = %job.url, "created job");
        self.publish(&job);

        Ok(job.id)
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.lock().jobs.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    /// Moves a job from `from` to `to`, applying `update` in the same step.
    ///
    /// Fails with `StaleTransition` if the job isn't currently in `from` or
    /// the edge isn't part of the state machine, leaving the job untouched.
    pub fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        let job = {
            let mut inner = self.lock();
            let current = inner.jobs.get(&id).ok_or(Error::NotFound(id))?;

            if current.status != from || !from.can_become(to) {
                return Err(Error::StaleTransition {
                    id,
                    expected: from,
                    found: current.status,
                    wanted: to,
                });
            }

            let mut next = current.clone();
            next.status = to;
            if let Some(attempts) = update.attempts {
                next.attempts = attempts.min(next.max_attempts);
            }
            if let Some(at) = update.last_attempt {
                next.last_attempt = Some(at);
            }
            if let Some(error) = update.last_error {
                next.last_error = error;
            }

            if let Some(journal) = inner.journal.as_mut() {
                journal.append(&next)?;
            }
            inner.jobs.insert(id, next.clone());
            next
        };

        debug!(job = %id, %from, %to, attempts = job.attempts, "transitioned");
        self.publish(&job);

        Ok(job)
    }

    /// The current status of a job, without copying the record.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.lock().jobs.get(&id).map(|j| j.status)
    }

    /// Ids of jobs currently in `status`, oldest first.
    pub fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .map(|j| j.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn counts(&self) -> StatusCounts {
        let inner = self.lock();
        let mut counts = StatusCounts::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Number of journal records written since the store was opened.
    pub fn journal_records(&self) -> Option<u64> {
        self.lock().journal.as_ref().map(Journal::records_written)
    }

    /// Subscribes to events for mutations committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Sends journal appends to `path`, or back to the journal file with
    /// `None`.
    #[cfg(test)]
    pub(crate) fn redirect_journal(&self, path: Option<&Path>) {
        let mut inner = self.lock();
        if let Some(journal) = inner.journal.as_mut() {
            let target = match path {
                Some(path) => path.to_owned(),
                None => journal.path().to_owned(),
            };
            journal.redirect(&target).unwrap();
        }
    }

    fn publish(&self, job: &Job) {
        // Nobody listening is fine.
        let _ = self.events.send(JobEvent {
            id: job.id,
            status: job.status,
            attempts: job.attempts,
        });
    }
}

/// Accepts absolute http(s) URLs with a host.
fn parse_target(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| Error::InvalidInput(format!("{url:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" if parsed.host().is_some() => Ok(parsed),
        scheme => Err(Error::InvalidInput(format!(
            "{url:?}: unsupported target (scheme {scheme:?})"
        ))),
    }
}
