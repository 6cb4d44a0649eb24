use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::job::JobId;
use crate::types::states::JobStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The submitted URL isn't an absolute URL. Rejected before any job is
    /// created.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    /// The job wasn't in the expected state, or the edge isn't part of the
    /// state machine. Usually a lost race or a duplicate delivery.
    #[error(
        "stale transition on job {id}: expected {expected}, found {found}, \
         wanted {wanted}"
    )]
    StaleTransition {
        id: JobId,
        expected: JobStatus,
        found: JobStatus,
        wanted: JobStatus,
    },

    /// The lease token doesn't match the current holder of the entry.
    #[error("invalid lease for job {0}")]
    InvalidLease(JobId),

    #[error("render timed out after {}s", .0.as_secs_f64())]
    RenderTimeout(Duration),

    #[error("render failed: {0}")]
    RenderFailure(String),

    #[error("no browser became available within {}s", .0.as_secs_f64())]
    ResourceExhausted(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading or writing the journal or the screenshot directory.
    #[error("storage: {0}")]
    Storage(#[from] io::Error),

    #[error("journal record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Whether a render attempt that failed with this error may succeed if
    /// retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RenderTimeout(_)
                | Error::RenderFailure(_)
                | Error::ResourceExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::RenderTimeout(Duration::from_secs(30)).is_transient());
        assert!(Error::RenderFailure("net::ERR_NAME".into()).is_transient());
        let exhausted = Error::ResourceExhausted(Duration::from_secs(1));
        assert!(exhausted.is_transient());

        assert!(!Error::InvalidInput("nope".into()).is_transient());
        assert!(!Error::InvalidLease(JobId(4)).is_transient());
        assert!(!Error::NotFound(JobId(4)).is_transient());
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let e = Error::RenderTimeout(Duration::from_millis(1500));
        assert_eq!(e.to_string(), "render timed out after 1.5s");
    }
}
