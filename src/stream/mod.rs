//! Stream endpoints and the two I/O strategies behind them.
//!
//! A [`PipeReader`] or [`PipeWriter`] hides whether the pipe is driven
//! with native non-blocking calls ([`native`], unix only) or drained by a
//! background worker into a buffer ([`threaded`]). The endpoints layer
//! end-of-file and closed-stream bookkeeping on top and map I/O errors
//! onto [`Error`].

use crate::error::{Error, Result};
use crate::poller::Timeout;
use std::fmt;
use std::io;
use std::time::Duration;
use tracing::trace;

#[cfg(unix)]
pub(crate) mod native;
pub(crate) mod threaded;

/// Most bytes a single read hands back. Anything beyond stays in the pipe
/// or the staging buffer for the next read.
pub(crate) const READ_LIMIT: usize = 64 * 1024;

/// Names one of the three standard streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Selects a readable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    Stdout,
    Stderr,
}

impl From<Output> for StreamId {
    fn from(o: Output) -> Self {
        match o {
            Output::Stdout => Self::Stdout,
            Output::Stderr => Self::Stderr,
        }
    }
}

/// How the pipes of a child are driven. Fixed at build time for the whole
/// process; see [`IoMode::current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// The OS pipe itself is non-blocking; reads and writes return
    /// whatever is possible right now.
    Native,
    /// A worker thread per readable stream performs blocking reads into a
    /// buffer the caller drains.
    ReaderThread,
}

impl IoMode {
    /// The strategy every child of this process uses: reader threads on
    /// windows, or on unix with the `reader-thread` feature; native
    /// non-blocking pipes otherwise.
    pub const fn current() -> Self {
        if cfg!(any(windows, feature = "reader-thread")) {
            Self::ReaderThread
        } else {
            Self::Native
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::ReaderThread => "reader-thread",
        }
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one read attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Data(Vec<u8>),
    TimedOut,
    Eof,
}

/// Read half of an I/O strategy.
pub(crate) trait PipeReader: Send {
    /// Returns as soon as at least one byte is available, the pipe
    /// reports end-of-file, or `timeout` elapses.
    fn read(&mut self, timeout: Timeout) -> io::Result<Chunk>;

    /// Stops any background activity and releases the pipe. Waits at
    /// most `grace` for a worker to finish. Calling it twice is a no-op.
    fn shutdown(&mut self, grace: Duration);
}

/// Write half of an I/O strategy.
pub(crate) trait PipeWriter: Send {
    /// Writes a prefix of `buf` and returns its length.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// The parent's end of the child's stdout or stderr.
pub(crate) struct ReadEndpoint {
    id: StreamId,
    reader: Box<dyn PipeReader>,
    eof: bool,
    closed: bool,
}

impl ReadEndpoint {
    pub(crate) fn new(id: StreamId, reader: Box<dyn PipeReader>) -> Self {
        Self {
            id,
            reader,
            eof: false,
            closed: false,
        }
    }

    /// An empty vector means nothing arrived before the timeout.
    pub(crate) fn read(&mut self, timeout: Timeout) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::StreamClosed(self.id));
        }
        if self.eof {
            return Err(Error::EndOfStream(self.id));
        }
        match self.reader.read(timeout) {
            Ok(Chunk::Data(bytes)) => {
                trace!(stream = %self.id, len = bytes.len(), "read");
                Ok(bytes)
            }
            Ok(Chunk::TimedOut) => Ok(Vec::new()),
            Ok(Chunk::Eof) => {
                self.eof = true;
                Err(Error::EndOfStream(self.id))
            }
            Err(source) => Err(Error::Io {
                stream: self.id,
                source,
            }),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn close(&mut self, grace: Duration) {
        if !self.closed {
            self.closed = true;
            self.reader.shutdown(grace);
        }
    }
}

/// The parent's end of the child's stdin.
pub(crate) struct WriteEndpoint {
    writer: Box<dyn PipeWriter>,
}

impl WriteEndpoint {
    pub(crate) fn new(writer: Box<dyn PipeWriter>) -> Self {
        Self { writer }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.writer.write(buf).map_err(|source| Error::Io {
            stream: StreamId::Stdin,
            source,
        })?;
        trace!(stream = %StreamId::Stdin, len = n, "wrote");
        Ok(n)
    }
}
