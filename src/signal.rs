//! Signal catalog and the mapping of stop requests onto the platform.
//!
//! Names are normalised before lookup: case does not matter and the
//! `SIG` prefix is optional, so `"term"`, `"TERM"` and `"SIGTERM"` all
//! name the same signal. Which names exist depends on the platform; a
//! name outside the catalog is an error, never a silent no-op.

use crate::error::{Error, Result};
use crate::sys::OsProcess;
use std::collections::BTreeMap;
use std::io;
use std::sync::OnceLock;
use tracing::debug;

#[cfg(unix)]
mod platform {
    use nix::sys::signal::Signal;

    pub(super) const TERMINATE: i32 = Signal::SIGTERM as i32;
    pub(super) const KILL: i32 = Signal::SIGKILL as i32;

    pub(super) fn entries() -> impl Iterator<Item = (&'static str, i32)> {
        Signal::iterator().map(|s| (s.as_str(), s as i32))
    }
}

#[cfg(windows)]
mod platform {
    // CRT numbering. Every entry maps to TerminateProcess, there is no
    // distinct forced kill.
    pub(super) const TERMINATE: i32 = 15;
    pub(super) const KILL: i32 = 9;

    pub(super) fn entries() -> impl Iterator<Item = (&'static str, i32)> {
        [("SIGINT", 2), ("SIGKILL", KILL), ("SIGTERM", TERMINATE)].into_iter()
    }
}

/// Read-only map from signal name to number for the current platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalTable {
    by_name: BTreeMap<&'static str, i32>,
}

impl SignalTable {
    /// Builds the catalog of the platform this crate was compiled for.
    pub fn for_platform() -> Self {
        Self {
            by_name: platform::entries().collect(),
        }
    }

    /// Looks up a signal by (normalised) name.
    pub fn get(&self, name: &str) -> Option<i32> {
        self.by_name.get(normalize(name).as_str()).copied()
    }

    /// Like [`get`](Self::get), but an unknown name is an error.
    pub fn resolve(&self, name: &str) -> Result<i32> {
        self.get(name)
            .ok_or_else(|| Error::UnknownSignal(name.to_owned()))
    }

    /// Canonical name for a signal number, e.g. `"SIGKILL"`.
    pub fn name_of(&self, signo: i32) -> Option<&'static str> {
        self.by_name
            .iter()
            .find(|(_, n)| **n == signo)
            .map(|(name, _)| *name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, i32)> + '_ {
        self.by_name.iter().map(|(name, n)| (*name, *n))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn normalize(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    }
}

/// The process-wide catalog. Built on first use and never modified.
pub fn catalog() -> &'static SignalTable {
    static CATALOG: OnceLock<SignalTable> = OnceLock::new();
    CATALOG.get_or_init(SignalTable::for_platform)
}

/// What the caller asked the child to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// Polite stop; forced where the platform has nothing polite.
    Terminate,
    /// Unconditional stop.
    Kill,
    /// A specific catalog entry.
    Signal(i32),
}

impl Request {
    pub(crate) fn signo(self) -> i32 {
        match self {
            Self::Terminate => platform::TERMINATE,
            Self::Kill => platform::KILL,
            Self::Signal(n) => n,
        }
    }
}

/// Delivers `request` to a child that is known to be running.
pub(crate) fn dispatch(process: &mut OsProcess, request: Request) -> io::Result<()> {
    let signo = request.signo();
    debug!(pid = process.pid(), signo, ?request, "delivering signal");
    process.deliver(signo)
}
