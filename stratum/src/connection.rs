//! Line framing over a duplex byte stream.

use crate::{
    error::{StratumError, StratumResult},
    protocol::encode,
};
use prosper_core::triggers::{Listener, SingleTrigger};
use serde::Serialize;
use std::pin::Pin;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::Mutex,
};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

const READ_BUFFER_SIZE: usize = 8192;

/// Longest line accepted from a peer, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Lifecycle of a session, in the order it is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connected,
    Subscribed,
    Authorized,
    Closed,
}

/// A stream split into its two framed halves.
pub struct Connection {
    pub reader: LineReader,
    pub writer: LineWriter,
}

impl Connection {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self { reader: LineReader::new(Box::pin(read)), writer: LineWriter::new(Box::pin(write)) }
    }
}

pub struct LineReader {
    inner: BufReader<BoxedReader>,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(read: BoxedReader) -> Self {
        Self { inner: BufReader::with_capacity(READ_BUFFER_SIZE, read), buf: Vec::with_capacity(READ_BUFFER_SIZE) }
    }

    /// Next non-blank line without its terminator, or `None` once the peer closed the stream.
    /// Fails on a line longer than [`MAX_LINE_LENGTH`].
    pub async fn read_line(&mut self) -> StratumResult<Option<String>> {
        loop {
            self.buf.clear();
            let limit = MAX_LINE_LENGTH as u64 + 1;
            if (&mut self.inner).take(limit).read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            if self.buf.len() > MAX_LINE_LENGTH && self.buf.last() != Some(&b'\n') {
                return Err(StratumError::Protocol(format!("line exceeds {} bytes", MAX_LINE_LENGTH)));
            }
            // invalid UTF-8 is left for the decoder to reject
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

/// Serializes writes so that concurrent senders never interleave lines.
pub struct LineWriter {
    inner: Mutex<Option<BoxedWriter>>,
    closing: SingleTrigger,
}

impl LineWriter {
    fn new(write: BoxedWriter) -> Self {
        Self { inner: Mutex::new(Some(write)), closing: SingleTrigger::new() }
    }

    pub async fn send<T: Serialize>(&self, message: &T) -> StratumResult<()> {
        self.write_line(&encode(message)?).await
    }

    /// Writes `payload` verbatim followed by a newline.
    pub async fn send_raw(&self, payload: &[u8]) -> StratumResult<()> {
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        self.write_line(&line).await
    }

    /// Writes one line, giving up as soon as the writer is closed, even midway
    /// through a write to a peer that stopped reading.
    async fn write_line(&self, line: &[u8]) -> StratumResult<()> {
        if self.is_closed() {
            return Err(StratumError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.closing.listener.clone() => {
                self.release();
                Err(StratumError::ConnectionClosed)
            }
            result = self.write_locked(line) => result,
        }
    }

    async fn write_locked(&self, line: &[u8]) -> StratumResult<()> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(StratumError::ConnectionClosed)?;
        let result = async {
            writer.write_all(line).await?;
            writer.flush().await
        }
        .await;
        if result.is_err() {
            self.closing.trigger.trigger();
            guard.take();
        }
        Ok(result?)
    }

    /// Drops the write half unless a write still holds it; that write is
    /// cancelled by the closing trigger and releases it in turn.
    fn release(&self) {
        if let Ok(mut guard) = self.inner.try_lock() {
            guard.take();
        }
    }

    /// Closes the writer. A write in flight fails with
    /// [`StratumError::ConnectionClosed`].
    pub fn close(&self) {
        self.closing.trigger.trigger();
        self.release();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_triggered()
    }

    /// Fires once the writer is closed.
    pub fn closed(&self) -> Listener {
        self.closing.listener.clone()
    }
}
