use crate::child::ProcessState;
use crate::stream::StreamId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while spawning or driving a child.
#[derive(Debug, Error)]
pub enum Error {
    /// The executable does not exist, is not a regular file, or is not
    /// executable by the current user.
    #[error("cannot execute {path:?}: {reason}")]
    InvalidExecutable { path: PathBuf, reason: String },

    /// An argument or the working directory cannot be passed to the OS.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An environment entry is malformed.
    #[error("invalid environment variable: {0}")]
    InvalidEnvironment(String),

    /// The signal name is not in this platform's catalog.
    #[error("unknown signal {0:?} on this platform")]
    UnknownSignal(String),

    /// The OS refused to create the process.
    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The operation needs a running child.
    #[error("process {pid} is not running ({state})")]
    NotRunning { pid: u32, state: ProcessState },

    /// The endpoint was closed by this side.
    #[error("{0} is closed")]
    StreamClosed(StreamId),

    /// The child closed its end of the pipe.
    #[error("{0} reached end of file")]
    EndOfStream(StreamId),

    #[error("I/O error on {stream}: {source}")]
    Io {
        stream: StreamId,
        #[source]
        source: io::Error,
    },

    #[error("failed to query status of process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Coarse classification of [`Error`], so callers can tell bad input
/// from a refusing system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any OS resource was touched.
    Precondition,
    /// The OS failed to create the process; nothing was leaked.
    Spawn,
    /// The operation does not fit the current state of the handle.
    Usage,
    /// An OS call on an existing process or pipe failed.
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidExecutable { .. }
            | Self::InvalidArgument(_)
            | Self::InvalidEnvironment(_)
            | Self::UnknownSignal(_) => ErrorKind::Precondition,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::NotRunning { .. } | Self::StreamClosed(_) | Self::EndOfStream(_) => {
                ErrorKind::Usage
            }
            Self::Io { .. } | Self::Wait { .. } | Self::Signal { .. } => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
