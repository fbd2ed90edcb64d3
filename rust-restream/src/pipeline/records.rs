//! Record reader for encoder output.
//!
//! ffmpeg rewrites its stats line with bare `\r`, so a pipe carries long runs
//! without a newline. Records here end at either `\r` or `\n`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK: usize = 4096;

/// Longest record kept; a longer run without a delimiter is split here.
pub const MAX_RECORD: usize = 64 * 1024;

/// Yields trimmed, non-empty text records from an async stream.
pub struct RecordReader<R> {
    inner: R,
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no delimiter.
    scanned: usize,
    eof: bool,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(CHUNK),
            scanned: 0,
            eof: false,
        }
    }

    /// Next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let found = self.pending[self.scanned..]
                .iter()
                .position(|b| matches!(b, b'\n' | b'\r'))
                .map(|i| self.scanned + i);

            if let Some(end) = found.filter(|&end| end <= MAX_RECORD) {
                self.scanned = 0;
                if let Some(record) = take_record(&mut self.pending, end) {
                    return Ok(Some(record));
                }
                continue;
            }
            self.scanned = self.pending.len();

            if self.pending.len() >= MAX_RECORD {
                self.scanned = 0;
                if let Some(record) = take_record(&mut self.pending, MAX_RECORD) {
                    return Ok(Some(record));
                }
                continue;
            }

            if self.eof {
                self.scanned = 0;
                let end = self.pending.len();
                return Ok(take_record(&mut self.pending, end));
            }

            let mut chunk = [0u8; CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Remove `buf[..end]` plus any delimiter run after it.
fn take_record(buf: &mut Vec<u8>, end: usize) -> Option<String> {
    let skip = buf[end..]
        .iter()
        .take_while(|b| matches!(b, b'\n' | b'\r'))
        .count();
    let bytes: Vec<u8> = buf.drain(..end + skip).take(end).collect();
    let record = String::from_utf8_lossy(&bytes).trim().to_string();
    (!record.is_empty()).then_some(record)
}
