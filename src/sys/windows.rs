//! CreateProcess backend. Anonymous pipes on this platform only block,
//! so every readable stream is drained by a reader thread.

use super::{worker_name, ExitStatus, SpawnRequest, Spawned};
use crate::error::{Error, Result};
use crate::stream::threaded::{BlockingWriter, ThreadedReader};
use crate::stream::{ReadEndpoint, StreamId, WriteEndpoint};
use std::io;
use std::os::windows::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tracing::debug;

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub(crate) fn check_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| Error::InvalidExecutable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !meta.is_file() {
        return Err(Error::InvalidExecutable {
            path: path.to_path_buf(),
            reason: "not a regular file".into(),
        });
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct OsProcess {
    child: Child,
    // signal number recorded when this side forced termination
    forced: Option<i32>,
}

impl OsProcess {
    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?.map(|status| match self.forced {
            Some(signo) => ExitStatus::Signaled(signo),
            None => ExitStatus::Exited(status.code().unwrap_or(-1)),
        }))
    }

    /// There is no graceful signal here: every catalog entry ends in
    /// TerminateProcess. A child that already exited on its own keeps
    /// its exit code.
    pub(crate) fn deliver(&mut self, signo: i32) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            debug!(pid = self.pid(), signo, "already exited, not forcing");
            return Ok(());
        }
        self.child.kill()?;
        self.forced.get_or_insert(signo);
        Ok(())
    }

    fn abandon(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub(crate) fn spawn(req: &SpawnRequest<'_>) -> Result<Spawned> {
    let spawn_failed = |source: io::Error| Error::Spawn {
        path: req.program.to_path_buf(),
        source,
    };

    let mut cmd = Command::new(req.program);
    cmd.args(req.args)
        .env_clear()
        .envs(req.env.iter())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    if let Some(dir) = req.cwd {
        cmd.current_dir(dir);
    }

    debug!(program = ?req.program, args = ?req.args, "creating process");
    let mut child = cmd.spawn().map_err(spawn_failed)?;
    let pid = child.id();
    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
    let process = OsProcess {
        child,
        forced: None,
    };
    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
        process.abandon();
        return Err(spawn_failed(io::Error::other("child pipes missing")));
    };

    let readers = ThreadedReader::spawn(stdout, worker_name(pid, StreamId::Stdout)).and_then(
        |out| Ok((out, ThreadedReader::spawn(stderr, worker_name(pid, StreamId::Stderr))?)),
    );
    match readers {
        Ok((out, err)) => Ok(Spawned {
            process,
            stdin: WriteEndpoint::new(Box::new(BlockingWriter::new(stdin))),
            stdout: ReadEndpoint::new(StreamId::Stdout, Box::new(out)),
            stderr: ReadEndpoint::new(StreamId::Stderr, Box::new(err)),
        }),
        Err(e) => {
            process.abandon();
            Err(spawn_failed(e))
        }
    }
}
