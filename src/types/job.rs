use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::states::JobStatus;

/// Opaque job identifier handed back to submitters.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Where the screenshot for this job lives under `storage_root`.
    pub fn artifact_path(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(format!("{}.png", self.0))
    }

    /// Scratch path a render writes to before it's moved into place.
    pub(crate) fn partial_path(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(format!("{}.png.part", self.0))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub url: Url,
    pub status: JobStatus,
    /// Number of finished attempts, successful or not.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub(crate) fn new(id: JobId, url: Url, max_attempts: u32) -> Self {
        Self {
            id,
            url,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            created: Utc::now(),
            last_attempt: None,
            last_error: None,
        }
    }
}

/// Field changes applied together with a status transition.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub attempts: Option<u32>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,
}

impl JobUpdate {
    /// The update for a worker starting an attempt.
    pub fn started() -> Self {
        Self {
            last_attempt: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// The update for a finished attempt; `error` is `None` on success.
    pub fn finished(attempts: u32, error: Option<String>) -> Self {
        Self {
            attempts: Some(attempts),
            last_error: Some(error),
            ..Default::default()
        }
    }
}

/// Published after a mutation to a job has been committed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
}
