use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line accepted by default, excluding the CRLF. Comfortably fits a
/// `put` with a URL of `parser::MAX_URL_LEN` bytes.
pub const DEFAULT_MAX_LINE: usize = 4096;

/// Provides a facility to read CRLF-terminated lines from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but lacks a CRLF.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
    /// A line with more bytes than this, CRLF excluded, is an error.
    max_line: usize,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    pub fn with_max_line(reader: T, max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader,
            pending_error: None,
            max_line,
        }
    }

    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    ///
    /// A line longer than the limit yields an `InvalidData` error. The reader
    /// can't find the start of the next line after that, so callers should
    /// drop the connection.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Only scan the bytes we haven't looked at yet, starting one byte
            // early in case a \r arrived at the end of the previous read and
            // its \n at the start of this one. Pipelined lines that arrived in
            // the same read are drained before reading again.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let end = self.maybe_crlf_from + eoc;
                if end > self.max_line {
                    return Err(too_long(self.max_line));
                }

                let line = self.buf.split_to(end + 2).freeze();

                // Restart scanning from the start of the unread remainder.
                self.maybe_crlf_from = 0;

                return Ok(Some(line.slice(..end)));
            }

            // No CRLF yet, and already too much to be a valid line: a trailing
            // \r is allowed since its \n may be next.
            let pending = match self.buf.last() {
                Some(b'\r') => self.buf.len() - 1,
                _ => self.buf.len(),
            };
            if pending > self.max_line {
                return Err(too_long(self.max_line));
            }

            // Try reading from the reader and accumulating in the buffer;
            // if we receive any bytes, re-scan for a CRLF, otherwise assume
            // the connection is dead/closed.
            let n_bytes_read = match self.reader.read_buf(&mut self.buf).await
            {
                Ok(n) => n,
                Err(e) => {
                    self.pending_error = Some(e);
                    0
                },
            };

            // Point maybe_crlf_from at the byte before the first new one (or
            // 0 if the buffer was empty).
            self.maybe_crlf_from =
                self.buf.len().saturating_sub(n_bytes_read + 1);

            // Zero bytes means end of stream, or an error we're now due to
            // return since no further line can be parsed.
            if n_bytes_read == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
        }
    }
}

fn too_long(max_line: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line too long (limit {max_line} bytes)"),
    )
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self::with_max_line(value, DEFAULT_MAX_LINE)
    }
}
