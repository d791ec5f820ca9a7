use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    unistd::{dup2, pipe2},
};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

// returns (read_end_fd, write_end_fd) of a pipe with CLOEXEC flag set
pub(super) fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut flags = OFlag::empty();
    flags.set(OFlag::O_CLOEXEC, true);
    Ok(pipe2(flags)?)
}

/// One pipe between the parent and a standard fd of the child.
///
/// Both ends are created close-on-exec. After `fork()` the child
/// `dup2()`s its end onto `child_fd` (the duplicate does not inherit
/// CLOEXEC), and the parent drops the child's end so that end-of-file
/// propagates once the child exits.
///
/// The parent is assumed to have fds 0-2 open, so neither pipe end can
/// land on a standard fd that a later `dup2()` would clobber.
pub(super) struct StdioPipe {
    child_fd: RawFd,
    child_end: Option<OwnedFd>,
    parent_end: Option<OwnedFd>,
}

impl StdioPipe {
    /// The child reads from `child_fd`; the parent keeps the write end.
    /// Use with fd 0.
    pub(super) fn to_child(child_fd: RawFd) -> io::Result<Self> {
        let (pipe_r, pipe_w) = cloexec_pipe()?;
        Ok(Self {
            child_fd,
            child_end: Some(pipe_r),
            parent_end: Some(pipe_w),
        })
    }

    /// The child writes to `child_fd`; the parent keeps the read end.
    /// Use with fds 1 and 2.
    pub(super) fn from_child(child_fd: RawFd) -> io::Result<Self> {
        let (pipe_r, pipe_w) = cloexec_pipe()?;
        Ok(Self {
            child_fd,
            child_end: Some(pipe_w),
            parent_end: Some(pipe_r),
        })
    }

    // NOTE: runs between fork and exec. Only async-signal-safe calls,
    // no allocation, no dropping of OwnedFds.
    pub(super) fn child_post_fork(&self) -> nix::Result<()> {
        let Some(fd) = self.child_end.as_ref().map(|x| x.as_raw_fd()) else {
            return Ok(());
        };
        if fd == self.child_fd {
            // dup2 onto itself keeps CLOEXEC, clear it by hand
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        } else {
            dup2(fd, self.child_fd)?;
        }
        Ok(())
    }

    // close the child's side of the pipe
    pub(super) fn parent_post_fork(&mut self) {
        self.child_end.take();
    }

    pub(super) fn take_parent_end(&mut self) -> Option<OwnedFd> {
        self.parent_end.take()
    }
}
