//! fork/exec backend.

mod stdio;

use super::{worker_name, ExitStatus, SpawnRequest, Spawned};
use crate::error::{Error, Result};
use crate::stream::native::{NonBlockingReader, NonBlockingWriter};
use crate::stream::threaded::{BlockingWriter, ThreadedReader};
use crate::stream::{IoMode, PipeReader, PipeWriter, ReadEndpoint, StreamId, WriteEndpoint};
use nix::errno::Errno;
use nix::sys::signal::{kill, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{access, chdir, execve, fork, setsid, AccessFlags, ForkResult, Pid};
use std::convert::Infallible;
use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use stdio::{cloexec_pipe, StdioPipe};
use tracing::debug;

/// Exit status of a child whose exec step failed.
const EXEC_FAILED: i32 = 127;

/// Rejects paths that cannot be executed, without touching any process
/// state.
pub(crate) fn check_executable(path: &Path) -> Result<()> {
    let invalid = |reason: String| Error::InvalidExecutable {
        path: path.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file".into()));
    }
    access(path, AccessFlags::X_OK).map_err(|e| invalid(e.desc().into()))?;
    Ok(())
}

fn cstring(s: &OsStr, what: &str) -> Result<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("{what} {s:?} contains a NUL byte")))
}

/// A child created by `fork()`. The pid stays valid until it is reaped by
/// [`OsProcess::try_wait`].
#[derive(Debug)]
pub(crate) struct OsProcess {
    pid: Pid,
}

impl OsProcess {
    pub(crate) fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Reaps the child if it has ended. Must not be called again after it
    /// returned `Some`.
    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        loop {
            return match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitStatus::Exited(code))),
                Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(ExitStatus::Signaled(sig as i32))),
                Ok(_) => Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    pub(crate) fn deliver(&mut self, signo: i32) -> io::Result<()> {
        let signal = Signal::try_from(signo)?;
        kill(self.pid, signal)?;
        Ok(())
    }

    // rollback for a child that never became a handle
    fn abandon(self) {
        let _ = kill(self.pid, Signal::SIGKILL);
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
    }
}

/// Forks and execs the requested program with its stdio wired to fresh
/// pipes.
///
/// Exec failures are reported back through an extra close-on-exec pipe:
/// EOF on it means `execve()` succeeded, four bytes carry the child's
/// errno. On any failure the child is reaped and every pipe closed
/// before the error is returned.
pub(crate) fn spawn(req: &SpawnRequest<'_>) -> Result<Spawned> {
    // allocate everything before fork(); the child may not allocate
    let program = cstring(req.program.as_os_str(), "executable path")?;
    let mut argv = Vec::with_capacity(req.args.len() + 1);
    argv.push(program.clone());
    for arg in req.args {
        argv.push(cstring(arg, "argument")?);
    }
    let mut envp = Vec::with_capacity(req.env.len());
    for (k, v) in req.env.iter() {
        let mut var = k.as_bytes().to_vec();
        var.push(b'=');
        var.extend_from_slice(v.as_bytes());
        envp.push(CString::new(var).map_err(|_| {
            Error::InvalidEnvironment(format!("{k:?} contains a NUL byte"))
        })?);
    }
    let cwd = req
        .cwd
        .map(|dir| cstring(dir.as_os_str(), "working directory"))
        .transpose()?;

    let spawn_failed = |source: io::Error| Error::Spawn {
        path: req.program.to_path_buf(),
        source,
    };
    let mut wiring = [
        StdioPipe::to_child(0).map_err(spawn_failed)?,
        StdioPipe::from_child(1).map_err(spawn_failed)?,
        StdioPipe::from_child(2).map_err(spawn_failed)?,
    ];
    let (status_r, status_w) = cloexec_pipe().map_err(spawn_failed)?;

    debug!(program = ?req.program, args = ?req.args, "forking");
    // SAFETY: the child branch only makes async-signal-safe calls on
    // memory prepared above and leaves through execve() or _exit().
    let pid = match unsafe { fork() }.map_err(|e| spawn_failed(e.into()))? {
        ForkResult::Child => {
            exec_child(&program, &argv, &envp, cwd.as_deref(), &wiring, status_w)
        }
        ForkResult::Parent { child } => child,
    };

    drop(status_w);
    for pipe in wiring.iter_mut() {
        pipe.parent_post_fork();
    }
    let process = OsProcess { pid };

    match read_exec_status(status_r) {
        Ok(None) => {}
        Ok(Some(errno)) => {
            process.abandon();
            return Err(spawn_failed(io::Error::from_raw_os_error(errno)));
        }
        Err(e) => {
            process.abandon();
            return Err(spawn_failed(e));
        }
    }

    let [mut stdin, mut stdout, mut stderr] = wiring;
    let ends = (
        stdin.take_parent_end(),
        stdout.take_parent_end(),
        stderr.take_parent_end(),
    );
    let (Some(stdin), Some(stdout), Some(stderr)) = ends else {
        process.abandon();
        return Err(spawn_failed(io::Error::other("pipe end missing after fork")));
    };
    match endpoints(process.pid(), IoMode::current(), stdin, stdout, stderr) {
        Ok((stdin, stdout, stderr)) => Ok(Spawned {
            process,
            stdin,
            stdout,
            stderr,
        }),
        Err(e) => {
            process.abandon();
            Err(spawn_failed(e))
        }
    }
}

fn endpoints(
    pid: u32,
    mode: IoMode,
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
) -> io::Result<(WriteEndpoint, ReadEndpoint, ReadEndpoint)> {
    let (writer, out, err): (Box<dyn PipeWriter>, Box<dyn PipeReader>, Box<dyn PipeReader>) =
        match mode {
            IoMode::Native => (
                Box::new(NonBlockingWriter::new(stdin)?),
                Box::new(NonBlockingReader::new(stdout)?),
                Box::new(NonBlockingReader::new(stderr)?),
            ),
            IoMode::ReaderThread => (
                Box::new(BlockingWriter::new(File::from(stdin))),
                Box::new(ThreadedReader::spawn(
                    File::from(stdout),
                    worker_name(pid, StreamId::Stdout),
                )?),
                Box::new(ThreadedReader::spawn(
                    File::from(stderr),
                    worker_name(pid, StreamId::Stderr),
                )?),
            ),
        };
    Ok((
        WriteEndpoint::new(writer),
        ReadEndpoint::new(StreamId::Stdout, out),
        ReadEndpoint::new(StreamId::Stderr, err),
    ))
}

// EOF: exec succeeded. Four bytes: errno from the child.
fn read_exec_status(pipe: OwnedFd) -> io::Result<Option<i32>> {
    let mut pipe = File::from(pipe);
    let mut buf = [0u8; 4];
    let mut got = 0;
    while got < buf.len() {
        match pipe.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    match got {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(buf))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated exec status from child",
        )),
    }
}

fn exec_child(
    program: &CStr,
    argv: &[CString],
    envp: &[CString],
    cwd: Option<&CStr>,
    wiring: &[StdioPipe; 3],
    status: OwnedFd,
) -> ! {
    let errno = match prepare_and_exec(program, argv, envp, cwd, wiring) {
        Err(errno) => errno,
        Ok(never) => match never {},
    };
    let mut status = File::from(status);
    let _ = status.write_all(&(errno as i32).to_ne_bytes());
    unsafe { nix::libc::_exit(EXEC_FAILED) }
}

fn prepare_and_exec(
    program: &CStr,
    argv: &[CString],
    envp: &[CString],
    cwd: Option<&CStr>,
    wiring: &[StdioPipe; 3],
) -> nix::Result<Infallible> {
    // own session: no controlling terminal, out of the parent's job control
    setsid()?;
    // the Rust runtime ignores SIGPIPE; ignored dispositions survive exec
    // SAFETY: installing SIG_DFL runs no handler code
    unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    for pipe in wiring {
        pipe.child_post_fork()?;
    }
    if let Some(dir) = cwd {
        chdir(dir)?;
    }
    execve(program, argv, envp)
}
