//! Append-only job journal.
//!
//! Every committed mutation appends the full job record as one JSON line.
//! Replaying keeps the last record seen per id, so a journal can be compacted
//! at any time by writing out one line per live job.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::types::job::{Job, JobId};

const JOURNAL_FILE: &str = "jobs.wal";
const COMPACT_FILE: &str = "jobs.wal.compact";

pub(crate) struct Journal {
    path: PathBuf,
    /// Unbuffered: a record that failed to append must not linger and be
    /// written out by a later one.
    out: File,
    /// File length after the last complete record.
    len: u64,
    records_written: u64,
}

impl Journal {
    /// Opens (creating if needed) the journal in `dir`, returning the jobs
    /// it recorded. The file is compacted before new records are appended.
    pub(crate) fn open(dir: &Path) -> Result<(Self, Vec<Job>)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);

        let jobs = replay(&path)?;
        compact(dir, &path, &jobs)?;

        let out = OpenOptions::new().append(true).create(true).open(&path)?;
        let len = out.metadata()?.len();

        debug!(path = %path.display(), jobs = jobs.len(), "opened journal");

        Ok((
            Self {
                path,
                out,
                len,
                records_written: 0,
            },
            jobs,
        ))
    }

    /// Appends a job record, returning once it has reached the disk. On
    /// failure nothing of the record is kept.
    pub(crate) fn append(&mut self, job: &Job) -> Result<()> {
        let mut record = serde_json::to_vec(job)?;
        record.push(b'\n');

        let written = self
            .out
            .write_all(&record)
            .and_then(|()| self.out.sync_data());
        if let Err(error) = written {
            // Cut off any partial line so the next record starts clean.
            if let Err(trunc) = self.out.set_len(self.len) {
                warn!(error = %trunc, "couldn't truncate torn journal record");
            }
            return Err(error.into());
        }

        self.len += record.len() as u64;
        self.records_written += 1;
        Ok(())
    }

    /// Points appends at another file, e.g. one that always fails.
    #[cfg(test)]
    pub(crate) fn redirect(&mut self, path: &Path) -> std::io::Result<()> {
        self.out = OpenOptions::new().append(true).open(path)?;
        self.len = self.out.metadata()?.len();
        Ok(())
    }

    pub(crate) fn records_written(&self) -> u64 {
        self.records_written
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn replay(path: &Path) -> Result<Vec<Job>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?;
    let mut jobs: BTreeMap<JobId, Job> = BTreeMap::new();

    for (n, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Job>(line) {
            Ok(job) => {
                jobs.insert(job.id, job);
            },
            // A crash mid-append leaves a torn final line; anything earlier is
            // real corruption.
            Err(error) if n + 1 == lines.len() => {
                warn!(%error, line = n + 1, "discarding torn journal record");
            },
            Err(error) => return Err(error.into()),
        }
    }

    Ok(jobs.into_values().collect())
}

fn compact(dir: &Path, path: &Path, jobs: &[Job]) -> Result<()> {
    let tmp = dir.join(COMPACT_FILE);
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for job in jobs {
            serde_json::to_writer(&mut out, job)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
