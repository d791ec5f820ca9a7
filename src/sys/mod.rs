//! Platform process primitive.
//!
//! Each backend exposes the same surface: [`check_executable`],
//! [`spawn`] producing a [`Spawned`], and an `OsProcess` that can be
//! reaped without blocking and sent a signal number.

use crate::envconfig::Environment;
use crate::stream::{ReadEndpoint, WriteEndpoint};
use std::ffi::OsString;
use std::path::Path;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::{check_executable, spawn, OsProcess};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{check_executable, spawn, OsProcess};

/// Everything the OS needs to start one child. Validated by the caller.
pub(crate) struct SpawnRequest<'a> {
    pub(crate) program: &'a Path,
    pub(crate) args: &'a [OsString],
    pub(crate) env: &'a Environment,
    pub(crate) cwd: Option<&'a Path>,
}

/// A freshly started child and the parent's ends of its pipes.
pub(crate) struct Spawned {
    pub(crate) process: OsProcess,
    pub(crate) stdin: WriteEndpoint,
    pub(crate) stdout: ReadEndpoint,
    pub(crate) stderr: ReadEndpoint,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// Thread name for a reader worker.
pub(crate) fn worker_name(pid: u32, stream: crate::stream::StreamId) -> String {
    format!("chaperone-{pid}-{stream}")
}
