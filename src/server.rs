//! The submission gateway: executes protocol commands against the engine and
//! serves them over a byte stream.
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::engine::Engine;
use crate::error::Error;
use crate::line_reader::LineReader;
use crate::parser::ParsingError;
use crate::types::job::JobId;
use crate::types::protocol::{Command, JobStats, Response};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

/// Runs a single command. `None` means the client asked to hang up.
pub fn execute(engine: &Engine, cmd: Command) -> Option<Response> {
    let resp = match cmd {
        Command::Put { url } => match engine.enqueue(&url) {
            Ok(id) => Response::Inserted { id: id.0 },
            Err(Error::InvalidInput(reason)) => {
                debug!(%url, %reason, "rejected submission");
                Response::InvalidInput
            },
            Err(Error::ShuttingDown) => Response::Draining,
            Err(error) => {
                error!(%error, "failed to admit job");
                Response::InternalError
            },
        },
        Command::StatsJob { id } => {
            let id = JobId(id);
            match engine.get(id) {
                Ok(job) => Response::OkStatsJob {
                    data: JobStats::new(&job, engine.artifact_path(id)),
                },
                Err(Error::NotFound(_)) => Response::NotFound,
                Err(error) => {
                    error!(%error, job = %id, "failed to look up job");
                    Response::InternalError
                },
            }
        },
        Command::Stats => Response::OkStats {
            data: engine.stats(),
        },
        Command::Drain => {
            engine.drain();
            Response::Draining
        },
        Command::Quit => return None,
    };

    Some(resp)
}

/// Reads commands from `conn` and writes their responses until the client
/// quits or disconnects, or `cancel` fires.
pub async fn serve_conn<S>(
    engine: &Engine,
    cancel: CancellationToken,
    conn: &mut S,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (r, mut w) = tokio::io::split(conn);
    let mut r: LineReader<_> = r.into();

    loop {
        let line = select! {
            x = r.read_line() => x,
            _ = cancel.cancelled() => return Ok(()),
        };

        let resp = match line {
            Ok(Some(line)) => {
                trace!(line = bytes_to_human_str(&line), "processing command");

                match Command::try_from(&line as &[u8]) {
                    Ok(cmd) => match execute(engine, cmd) {
                        Some(resp) => resp.serialise_wire(),
                        None => return Ok(()),
                    },
                    Err(error) => error.serialise_wire(),
                }
            },
            Ok(None) => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                // We can't find the next line boundary, so answer and hang
                // up.
                debug!(%error, "dropping connection");
                let resp = ParsingError::BadFormat.serialise_wire();
                select! {
                    x = w.write_all(&resp) => x?,
                    _ = cancel.cancelled() => return Ok(()),
                };
                select! {
                    x = w.flush() => x?,
                    _ = cancel.cancelled() => {},
                };
                return Ok(());
            },
            Err(error) => return Err(error),
        };

        // Writes race the cancellation token so a stalled client can't hold
        // up shutdown.
        select! {
            x = w.write_all(&resp) => x?,
            _ = cancel.cancelled() => return Ok(()),
        };

        // Flush once per response; pipelined requests get pipelined
        // responses.
        select! {
            x = w.flush() => x?,
            _ = cancel.cancelled() => return Ok(()),
        };
    }
}
