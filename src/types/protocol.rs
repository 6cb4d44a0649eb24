use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use super::job::Job;
use super::serialisable::WireSerialisable;
use super::states::JobStatus;
use crate::engine::EngineStats;

/// A command sent by a client to the submission gateway.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Submits a page to be captured.
    ///
    /// On the wire: `put <url>`
    Put { url: String },
    /// Describes a single job, whatever its state.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// Describes the engine as a whole: job counts by state, queue depths,
    /// browser pool usage.
    ///
    /// On the wire: `stats`
    Stats,
    /// Stops admitting jobs and asks the server to shut down once in-flight
    /// captures finish.
    ///
    /// On the wire: `drain`
    Drain,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// Responses to a parsed `Command`. Lines that fail to parse are answered
/// by `ParsingError`.
#[derive(Debug)]
pub enum Response {
    /// In response to a `put`, the job was admitted with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, the URL was rejected. No job was created.
    ///
    /// On the wire: `INVALID_INPUT`.
    InvalidInput,
    /// In response to a `put` or `drain`, the server isn't accepting jobs.
    ///
    /// On the wire: `DRAINING`.
    Draining,
    /// In response to a `stats-job`, no such job exists.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `stats-job`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
    /// In response to a `stats`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: EngineStats },
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        use Response::*;

        match self {
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            InvalidInput => b"INVALID_INPUT\r\n".to_vec(),
            Draining => b"DRAINING\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            OkStatsJob { data } => yaml_body(data),
            OkStats { data } => yaml_body(data),
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
        }
    }
}

fn yaml_body<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(error) => {
            error!(%error, "failed to encode stats");
            b"INTERNAL_ERROR\r\n".to_vec()
        },
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// page being captured
    pub url: String,
    /// job state
    pub state: JobStatus,
    /// number of finished attempts
    pub attempts: u32,
    /// attempts the job gets before it fails
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    /// time in seconds since creation
    pub age: i64,
    pub created: DateTime<Utc>,
    /// when the most recent attempt started
    #[serde(rename = "last-attempt")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// error message from the most recent failed attempt
    #[serde(rename = "last-error")]
    pub last_error: Option<String>,
    /// where the screenshot is written once the job completes
    pub artifact: PathBuf,
}

impl JobStats {
    pub fn new(job: &Job, artifact: PathBuf) -> Self {
        Self {
            id: job.id.0,
            url: job.url.to_string(),
            state: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            age: (Utc::now() - job.created).num_seconds().max(0),
            created: job.created,
            last_attempt: job.last_attempt,
            last_error: job.last_error.clone(),
            artifact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::JobId;

    #[test]
    fn test_simple_responses() {
        assert_eq!(
            Response::Inserted { id: 17 }.serialise_wire(),
            b"INSERTED 17\r\n"
        );
        assert_eq!(
            Response::InvalidInput.serialise_wire(),
            b"INVALID_INPUT\r\n"
        );
        assert_eq!(Response::Draining.serialise_wire(), b"DRAINING\r\n");
        assert_eq!(Response::NotFound.serialise_wire(), b"NOT_FOUND\r\n");
    }

    #[test]
    fn test_stats_job_body() {
        let mut job =
            Job::new(JobId(3), "https://example.com/".parse().unwrap(), 2);
        job.status = JobStatus::Failed;
        job.attempts = 2;
        job.last_error = Some("render timed out after 30s".into());

        let stats = JobStats::new(&job, PathBuf::from("/shots/3.png"));
        let wire = Response::OkStatsJob { data: stats }.serialise_wire();
        let wire = String::from_utf8(wire).unwrap();

        let (header, body) = wire.split_once("\r\n").unwrap();
        let body = body.strip_suffix("\r\n").unwrap();
        assert_eq!(header, format!("OK {}", body.len()));
        assert!(body.contains("state: failed"));
        assert!(body.contains("max-attempts: 2"));
        assert!(body.contains("last-error: render timed out after 30s"));
        assert!(body.contains("artifact: /shots/3.png"));
    }
}
