//! Newline-delimited JSON framing for envelopes.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, EncodeError};
use crate::message::Envelope;

const LINE_ENDINGS: &[u8] = b"\r\n";

/// Reads envelopes one line at a time, in arrival order.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    line: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line: 0,
        }
    }

    /// Returns the next frame, or `Ok(None)` once the input is closed.
    ///
    /// A line that does not parse becomes a [`DecodeError`] item; later
    /// lines are still readable. Only an I/O failure on the underlying
    /// reader is returned as `Err`.
    ///
    /// Cancel safe: a partially read line stays buffered and the next call
    /// picks up where the dropped one stopped.
    pub async fn next_frame(&mut self) -> io::Result<Option<Result<Envelope, DecodeError>>> {
        loop {
            // Raw bytes so invalid UTF-8 surfaces as a decode error for this frame only.
            self.reader.read_until(b'\n', &mut self.buf).await?;
            if self.buf.is_empty() {
                return Ok(None);
            }
            self.line += 1;

            let line = std::mem::take(&mut self.buf);
            let frame = trim_line_ending(&line);
            let decoded = if frame.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(serde_json::from_slice(frame).map_err(|source| DecodeError {
                    line: self.line,
                    frame: String::from_utf8_lossy(frame).into_owned(),
                    source,
                }))
            };
            self.buf = line;
            self.buf.clear();

            if let Some(decoded) = decoded {
                return Ok(Some(decoded));
            }
        }
    }

    /// Number of lines consumed so far, blank lines included.
    pub fn lines_read(&self) -> usize {
        self.line
    }
}

fn trim_line_ending(mut bytes: &[u8]) -> &[u8] {
    while let [rest @ .., last] = bytes {
        if !LINE_ENDINGS.contains(last) {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// Writes envelopes as complete lines. Each frame is flushed before the next one starts.
pub struct FrameWriter<W> {
    writer: W,
    buf: Vec<u8>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: Vec::new(),
        }
    }

    pub async fn write(&mut self, envelope: &Envelope) -> Result<(), EncodeError> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, envelope)?;
        self.buf.push(b'\n');
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flushes and closes the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), EncodeError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
