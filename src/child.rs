use crate::envconfig::Environment;
use crate::error::{Error, Result};
use crate::poller::{probe_until, Timeout};
use crate::signal::{self, Request, SignalTable};
use crate::stream::{IoMode, Output, ReadEndpoint, StreamId, WriteEndpoint};
use crate::sys::{self, ExitStatus, OsProcess, SpawnRequest};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// How long [`Child::close`] waits for a reader worker to notice its
/// pipe closed.
const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_millis(250);

/// Where a child is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessState {
    /// Nothing was spawned yet.
    #[default]
    NotStarted,
    Running,
    /// Exited on its own; the exit code is its status.
    Exited,
    /// Killed by a signal; the exit code is the signal number.
    Terminated,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Terminated)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached state and exit code. Moves forward only, and the exit code is
/// written exactly once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Lifecycle {
    state: ProcessState,
    exit_code: Option<i32>,
}

impl Lifecycle {
    fn started() -> Self {
        Self {
            state: ProcessState::Running,
            exit_code: None,
        }
    }

    // ignored unless running
    fn record(&mut self, status: ExitStatus) {
        if self.state != ProcessState::Running {
            return;
        }
        (self.state, self.exit_code) = match status {
            ExitStatus::Exited(code) => (ProcessState::Exited, Some(code)),
            ExitStatus::Signaled(signo) => (ProcessState::Terminated, Some(signo)),
        };
    }
}

/// Configures and starts one child process.
///
/// The executable is given by path and is not searched for in `PATH`.
/// It is always passed to the child as `argv[0]`, followed by the
/// arguments added here.
///
/// Example:
/// ```no_run
/// # use chaperone::*;
/// # fn main() -> chaperone::Result<()> {
/// let mut cmd = ChildBuilder::new("/bin/sh");
/// cmd.arg("-c").arg("echo hello");
/// let mut child = cmd.spawn()?;
/// let out = child.read(Output::Stdout, Timeout::millis(1_000))?;
/// assert_eq!(out, b"hello\n");
/// assert_eq!(child.wait(Timeout::Forever)?, Some(0));
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct ChildBuilder {
    program: PathBuf,
    args: Vec<OsString>,
    env: Option<Environment>,
    cwd: Option<PathBuf>,
    teardown_grace: Duration,
}

impl ChildBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }
    /// Adds one argument.
    pub fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.args.push(arg.into());
        self
    }
    /// Adds several arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
    /// Replaces the child's environment. Without this the child inherits
    /// the parent's environment as it is at spawn time. See
    /// [`crate::envconfig::EnvironmentBuilder`].
    pub fn set_env(&mut self, env: Environment) -> &mut Self {
        self.env = Some(env);
        self
    }
    /// Directory the child starts in. An empty path means the parent's.
    pub fn working_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        let dir = dir.into();
        self.cwd = (!dir.as_os_str().is_empty()).then_some(dir);
        self
    }
    /// Bounds how long teardown waits for reader workers to stop.
    pub fn teardown_grace(&mut self, grace: Duration) -> &mut Self {
        self.teardown_grace = grace;
        self
    }

    /// Starts the child. Bad input is rejected before any OS resource is
    /// acquired; if the OS refuses, nothing is left behind.
    pub fn spawn(&self) -> Result<Child> {
        sys::check_executable(&self.program)?;
        let inherited;
        let env = match &self.env {
            Some(env) => env,
            None => {
                inherited = Environment::inherited()?;
                &inherited
            }
        };
        debug!(program = ?self.program, io_mode = %IoMode::current(), "spawning");
        let spawned = sys::spawn(&SpawnRequest {
            program: &self.program,
            args: &self.args,
            env,
            cwd: self.cwd.as_deref(),
        })?;
        let pid = spawned.process.pid();
        info!(pid, program = ?self.program, "spawned");
        Ok(Child {
            pid,
            program: self.program.clone(),
            process: spawned.process,
            lifecycle: Lifecycle::started(),
            stdin: Some(spawned.stdin),
            stdout: spawned.stdout,
            stderr: spawned.stderr,
            signals: signal::catalog(),
            teardown_grace: self.teardown_grace,
            released: false,
        })
    }
}

/// Handle to one running (or finished) child and its three streams.
///
/// The handle is the only owner of the process and its pipes. Dropping
/// it, or calling [`close`](Self::close), kills the child if it is still
/// running, reaps it, stops reader workers and closes every pipe.
pub struct Child {
    pid: u32,
    program: PathBuf,
    process: OsProcess,
    lifecycle: Lifecycle,
    stdin: Option<WriteEndpoint>,
    stdout: ReadEndpoint,
    stderr: ReadEndpoint,
    signals: &'static SignalTable,
    teardown_grace: Duration,
    released: bool,
}

impl Child {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Always [`IoMode::current`].
    pub fn io_mode(&self) -> IoMode {
        IoMode::current()
    }

    /// The cached state, without asking the OS.
    pub fn state(&self) -> ProcessState {
        self.lifecycle.state
    }

    /// Exit status for [`ProcessState::Exited`], signal number for
    /// [`ProcessState::Terminated`], `None` before either.
    pub fn exit_code(&self) -> Option<i32> {
        self.lifecycle.exit_code
    }

    /// Checks whether the child has ended, waiting up to `timeout` for it
    /// to do so. Once a terminal state was observed it is returned
    /// without consulting the OS again.
    pub fn poll(&mut self, timeout: Timeout) -> Result<ProcessState> {
        if self.lifecycle.state.is_terminal() {
            return Ok(self.lifecycle.state);
        }
        let pid = self.pid;
        let process = &mut self.process;
        let status = probe_until(timeout, || process.try_wait())
            .map_err(|source| Error::Wait { pid, source })?;
        if let Some(status) = status {
            self.lifecycle.record(status);
            info!(pid, state = %self.lifecycle.state, code = ?self.lifecycle.exit_code, "reaped");
        }
        Ok(self.lifecycle.state)
    }

    /// [`poll`](Self::poll), then the exit code. `None` means the child
    /// did not end within `timeout`.
    pub fn wait(&mut self, timeout: Timeout) -> Result<Option<i32>> {
        self.poll(timeout)?;
        Ok(self.exit_code())
    }

    /// Reads whatever `stream` has, waiting up to `timeout` for the first
    /// byte. An empty vector means nothing arrived in time;
    /// [`Error::EndOfStream`] means the child closed the stream.
    pub fn read(&mut self, stream: Output, timeout: Timeout) -> Result<Vec<u8>> {
        self.endpoint(stream).read(timeout)
    }

    /// True once a read on `stream` has hit end-of-file.
    pub fn is_eof(&self, stream: Output) -> bool {
        match stream {
            Output::Stdout => self.stdout.is_eof(),
            Output::Stderr => self.stderr.is_eof(),
        }
    }

    /// Writes to the child's stdin and returns how many bytes went out.
    /// With native I/O this may be fewer than `buf.len()`, or zero, when
    /// the pipe is full.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stdin
            .as_mut()
            .ok_or(Error::StreamClosed(StreamId::Stdin))?
            .write(buf)
    }

    /// Closes stdin so the child reads end-of-file.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!(pid = self.pid, "stdin closed");
        }
    }

    /// Asks the child to stop. Forced where the platform has no polite
    /// signal.
    pub fn terminate(&mut self) -> Result<()> {
        self.signal(Request::Terminate)
    }

    /// Stops the child unconditionally, or as hard as the platform can.
    pub fn kill(&mut self) -> Result<()> {
        self.signal(Request::Kill)
    }

    /// Sends a signal by catalog name (`"SIGUSR1"`, `"usr1"`, ...).
    pub fn send_signal(&mut self, name: &str) -> Result<()> {
        let signo = self.signals.resolve(name)?;
        self.signal(Request::Signal(signo))
    }

    /// The catalog [`send_signal`](Self::send_signal) resolves names in.
    pub fn signals(&self) -> &'static SignalTable {
        self.signals
    }

    fn signal(&mut self, request: Request) -> Result<()> {
        // refresh first so a reaped pid is never signalled
        let state = self.poll(Timeout::Immediate)?;
        if state != ProcessState::Running {
            return Err(Error::NotRunning {
                pid: self.pid,
                state,
            });
        }
        signal::dispatch(&mut self.process, request).map_err(|source| Error::Signal {
            pid: self.pid,
            source,
        })
    }

    fn endpoint(&mut self, stream: Output) -> &mut ReadEndpoint {
        match stream {
            Output::Stdout => &mut self.stdout,
            Output::Stderr => &mut self.stderr,
        }
    }

    /// Releases everything the handle owns: closes stdin, kills and reaps
    /// the child if it still runs, stops reader workers and closes the
    /// output pipes. Once this succeeded, later calls do nothing; after a
    /// failure the next call (or `Drop`) tries to reap the child again.
    pub fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.close_stdin();
        let outcome = self.reap_on_teardown();
        self.stdout.close(self.teardown_grace);
        self.stderr.close(self.teardown_grace);
        self.released = outcome.is_ok();
        debug!(pid = self.pid, released = self.released, "closed");
        outcome
    }

    fn reap_on_teardown(&mut self) -> Result<()> {
        if self.poll(Timeout::Immediate)? != ProcessState::Running {
            return Ok(());
        }
        debug!(pid = self.pid, "killing child on teardown");
        signal::dispatch(&mut self.process, Request::Kill).map_err(|source| Error::Signal {
            pid: self.pid,
            source,
        })?;
        self.poll(Timeout::Forever)?;
        Ok(())
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("state", &self.lifecycle.state)
            .field("exit_code", &self.lifecycle.exit_code)
            .finish()
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(pid = self.pid, error = %e, "teardown failed");
        }
    }
}
