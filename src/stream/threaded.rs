//! Reader-thread emulation of non-blocking reads.
//!
//! Each readable pipe gets one worker that loops on blocking reads and
//! appends to a [`Staging`] buffer. The worker touches nothing but that
//! buffer; the foreground only ever drains it.

use super::{Chunk, PipeReader, PipeWriter, READ_LIMIT};
use crate::poller::Timeout;
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

#[derive(Default)]
struct Staging {
    data: Vec<u8>,
    eof: bool,
    error: Option<io::Error>,
}

/// State shared between one worker and its endpoint.
#[derive(Default)]
struct Shared {
    staging: Mutex<Staging>,
    ready: Condvar,
    stop: AtomicBool,
}

pub(crate) struct ThreadedReader {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedReader {
    /// Starts the worker. `name` labels the thread, e.g. `"pid-123-stdout"`.
    pub(crate) fn spawn<R>(pipe: R, name: String) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker = thread::Builder::new().name(name).spawn({
            let shared = Arc::clone(&shared);
            move || drain(pipe, &shared)
        })?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

// Worker body: blocking reads until EOF, an error, or a stop request.
fn drain<R: Read>(mut pipe: R, shared: &Shared) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let res = pipe.read(&mut buf);
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let mut staging = shared.staging.lock();
        match res {
            Ok(0) => {
                staging.eof = true;
                shared.ready.notify_all();
                break;
            }
            Ok(n) => {
                staging.data.extend_from_slice(&buf[..n]);
                shared.ready.notify_all();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                staging.error = Some(e);
                shared.ready.notify_all();
                break;
            }
        }
    }
}

impl PipeReader for ThreadedReader {
    fn read(&mut self, timeout: Timeout) -> io::Result<Chunk> {
        let deadline = timeout.deadline();
        let mut staging = self.shared.staging.lock();
        loop {
            if !staging.data.is_empty() {
                let rest = match staging.data.len() {
                    n if n > READ_LIMIT => staging.data.split_off(READ_LIMIT),
                    _ => Vec::new(),
                };
                return Ok(Chunk::Data(std::mem::replace(&mut staging.data, rest)));
            }
            if let Some(e) = staging.error.take() {
                // the worker is gone; later reads report EOF
                staging.eof = true;
                return Err(e);
            }
            if staging.eof {
                return Ok(Chunk::Eof);
            }
            match deadline.remaining() {
                Some(left) if left.is_zero() => return Ok(Chunk::TimedOut),
                Some(left) => {
                    self.shared.ready.wait_for(&mut staging, left);
                }
                None => self.shared.ready.wait(&mut staging),
            }
        }
    }

    fn shutdown(&mut self, grace: Duration) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        let name = worker.thread().name().unwrap_or("reader").to_owned();
        let give_up = Instant::now() + grace;
        while !worker.is_finished() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(1));
        }
        if worker.is_finished() {
            let _ = worker.join();
            debug!(worker = %name, "reader stopped");
        } else {
            // Still blocked in read(2), most likely because another process
            // holds the write end. It owns its half of `shared`, so it can
            // finish whenever that pipe closes.
            warn!(worker = %name, ?grace, "reader did not stop in time, detaching");
        }
    }
}

impl Drop for ThreadedReader {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

/// Plain blocking writes, used for stdin alongside [`ThreadedReader`].
/// A full pipe blocks the caller until the child reads.
pub(crate) struct BlockingWriter<W> {
    pipe: W,
}

impl<W: Write + Send> BlockingWriter<W> {
    pub(crate) fn new(pipe: W) -> Self {
        Self { pipe }
    }
}

impl<W: Write + Send> PipeWriter for BlockingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pipe.write_all(buf)?;
        self.pipe.flush()?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// A reader fed through a channel, so tests control when bytes arrive.
    struct Feed(mpsc::Receiver<Vec<u8>>);

    impl Read for Feed {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    fn feed() -> (mpsc::Sender<Vec<u8>>, ThreadedReader) {
        let (tx, rx) = mpsc::channel();
        let reader = ThreadedReader::spawn(Feed(rx), "test-reader".into()).unwrap();
        (tx, reader)
    }

    #[test]
    fn nothing_buffered_times_out() {
        let (_tx, mut reader) = feed();
        let start = Instant::now();
        assert_eq!(reader.read(Timeout::millis(50)).unwrap(), Chunk::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(reader.read(Timeout::Immediate).unwrap(), Chunk::TimedOut);
    }

    #[test]
    fn returns_as_soon_as_a_byte_arrives() {
        let (tx, mut reader) = feed();
        let start = Instant::now();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tx.send(b"x".to_vec()).unwrap();
        });
        assert_eq!(
            reader.read(Timeout::millis(5_000)).unwrap(),
            Chunk::Data(b"x".to_vec())
        );
        assert!(start.elapsed() < Duration::from_millis(2_000));
    }

    #[test]
    fn order_is_preserved_across_chunks() {
        let (tx, mut reader) = feed();
        for part in [&b"one "[..], b"two ", b"three"] {
            tx.send(part.to_vec()).unwrap();
        }
        drop(tx);
        let mut got = Vec::new();
        loop {
            match reader.read(Timeout::Forever).unwrap() {
                Chunk::Data(bytes) => got.extend(bytes),
                Chunk::Eof => break,
                Chunk::TimedOut => unreachable!(),
            }
        }
        assert_eq!(got, b"one two three");

        // EOF is published before the thread returns, so give it a moment
        let worker = reader.worker.take().unwrap();
        let give_up = Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.is_finished(), "worker still running after EOF");
        worker.join().unwrap();
    }

    #[test]
    fn one_read_hands_out_at_most_the_limit() {
        let (tx, mut reader) = feed();
        let parts = 2 * READ_LIMIT / READ_CHUNK + 1;
        for _ in 0..parts {
            tx.send(vec![b'q'; READ_CHUNK]).unwrap();
        }
        drop(tx);
        let mut sizes = Vec::new();
        loop {
            match reader.read(Timeout::Forever).unwrap() {
                Chunk::Data(bytes) => sizes.push(bytes.len()),
                Chunk::Eof => break,
                Chunk::TimedOut => unreachable!(),
            }
        }
        assert!(sizes.iter().all(|&n| n <= READ_LIMIT), "{sizes:?}");
        assert_eq!(sizes.iter().sum::<usize>(), parts * READ_CHUNK);
    }

    #[test]
    fn read_errors_surface_once_then_eof() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
        let mut reader = ThreadedReader::spawn(Broken, "broken".into()).unwrap();
        let err = reader.read(Timeout::Forever).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(reader.read(Timeout::Immediate).unwrap(), Chunk::Eof);
    }

    #[test]
    fn shutdown_joins_a_finished_worker() {
        let (tx, mut reader) = feed();
        drop(tx);
        assert_eq!(reader.read(Timeout::Forever).unwrap(), Chunk::Eof);
        reader.shutdown(Duration::from_millis(500));
        assert!(reader.worker.is_none());
        reader.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn shutdown_detaches_a_blocked_worker() {
        let (tx, mut reader) = feed();
        let start = Instant::now();
        reader.shutdown(Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(1_000));
        // the detached worker exits once its pipe closes
        drop(tx);
    }

    #[test]
    fn blocking_writer_writes_everything() {
        let mut sink = Vec::new();
        let n = BlockingWriter::new(&mut sink).write(b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"hello");
    }
}
