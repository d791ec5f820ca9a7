use super::{Chunk, PipeReader, PipeWriter, READ_LIMIT};
use crate::poller::{Deadline, Timeout};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

const READ_CHUNK: usize = 8192;

/// Sets `O_NONBLOCK` on the parent's end of a pipe.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Blocks until `fd` is ready for `events` or the deadline passes.
/// Returns false on timeout. Hang-up and error conditions count as
/// ready so that the following read or write reports them.
fn wait_ready(fd: &File, events: PollFlags, deadline: Deadline) -> io::Result<bool> {
    loop {
        let wait = match deadline.remaining() {
            None => PollTimeout::NONE,
            Some(left) => PollTimeout::from(round_up_millis(left)),
        };
        let mut fds = [PollFd::new(fd.as_fd(), events)];
        match poll(&mut fds, wait) {
            Ok(0) if deadline.expired() => return Ok(false),
            Ok(0) => continue,
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

// poll(2) takes whole milliseconds; round up so a sub-millisecond
// remainder does not turn into a busy loop.
fn round_up_millis(d: Duration) -> u16 {
    let ms = d.as_micros().div_ceil(1000);
    ms.min(u128::from(u16::MAX)) as u16
}

/// Read end of a pipe in `O_NONBLOCK` mode.
pub(crate) struct NonBlockingReader {
    pipe: Option<File>,
}

impl NonBlockingReader {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            pipe: Some(File::from(fd)),
        })
    }
}

impl PipeReader for NonBlockingReader {
    fn read(&mut self, timeout: Timeout) -> io::Result<Chunk> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(Chunk::Eof);
        };
        let deadline = timeout.deadline();
        let mut out = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let room = READ_LIMIT - out.len();
            if room == 0 {
                return Ok(Chunk::Data(out));
            }
            match pipe.read(&mut buf[..room.min(READ_CHUNK)]) {
                Ok(0) if out.is_empty() => return Ok(Chunk::Eof),
                // hand out what we have; EOF shows up on the next read
                Ok(0) => return Ok(Chunk::Data(out)),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !out.is_empty() {
                        return Ok(Chunk::Data(out));
                    }
                    if !wait_ready(pipe, PollFlags::POLLIN, deadline)? {
                        return Ok(Chunk::TimedOut);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(&mut self, _grace: Duration) {
        self.pipe.take();
    }
}

/// Write end of a pipe in `O_NONBLOCK` mode.
pub(crate) struct NonBlockingWriter {
    pipe: File,
}

impl NonBlockingWriter {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            pipe: File::from(fd),
        })
    }
}

impl PipeWriter for NonBlockingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.pipe.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}
