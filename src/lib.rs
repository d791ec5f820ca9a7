//! Spawn one child process and drive it without blocking indefinitely.
//! [`ChildBuilder`] starts the child; the returned [`Child`] owns the
//! process and the parent's ends of its stdin, stdout and stderr. Every
//! operation that can wait takes a [`Timeout`]: check once, block, or
//! block for at most a bound.
//!
//! On unix the pipes are switched to non-blocking mode and waited on with
//! `poll(2)`. Windows anonymous pipes only block, so there each readable
//! stream is drained by a background thread into a buffer that reads
//! consume; see [`IoMode`]. Both look the same from the outside. The
//! `reader-thread` cargo feature selects the threaded strategy on unix as
//! well. The choice is made at build time and applies to every child.
//!
//! The [`envconfig`] module has a builder for process environments - use
//! it to set environment variables and control what a child process
//! inherits from the parent process environment. The [`signal`] module
//! holds the platform's signal catalog.
//!
//! ```no_run
//! # use chaperone::*;
//! # fn main() -> chaperone::Result<()> {
//! let mut child = spawn("/bin/cat", [] as [&str; 0], None, None)?;
//! child.write(b"ping\n")?;
//! let echoed = child.read(Output::Stdout, Timeout::millis(500))?;
//! assert_eq!(echoed, b"ping\n");
//! child.terminate()?;
//! assert_eq!(child.poll(Timeout::Forever)?, ProcessState::Terminated);
//! # Ok(()) }
//! ```

mod child;
/// Types for manipulating the environment variables of a child process
pub mod envconfig;
mod error;
mod poller;
/// The signal catalog and the mapping of stop requests onto each
/// platform.
pub mod signal;
mod stream;
mod sys;

use std::ffi::OsString;
use std::path::PathBuf;

// re-exports
pub use child::{Child, ChildBuilder, ProcessState};
pub use envconfig::{Environment, EnvironmentBuilder};
pub use error::{Error, ErrorKind, Result};
pub use poller::Timeout;
pub use signal::SignalTable;
pub use stream::{IoMode, Output, StreamId};

/// Starts `program` with `args` (after the implicit `argv[0]`). `env`
/// `None` inherits the parent's environment; `cwd` `None` or empty
/// inherits the parent's directory. Shorthand for [`ChildBuilder`].
pub fn spawn<I, S>(
    program: impl Into<PathBuf>,
    args: I,
    env: Option<Environment>,
    cwd: Option<PathBuf>,
) -> Result<Child>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let mut builder = ChildBuilder::new(program);
    builder.args(args);
    if let Some(env) = env {
        builder.set_env(env);
    }
    if let Some(cwd) = cwd {
        builder.working_dir(cwd);
    }
    builder.spawn()
}

/// The platform's signal catalog, keyed by name.
pub fn signals() -> &'static SignalTable {
    signal::catalog()
}
