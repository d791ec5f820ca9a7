#![allow(dead_code)]

use chaperone::{Child, ChildBuilder, Error, Output, Timeout};
use std::time::{Duration, Instant};

pub const SH: &str = "/bin/sh";

/// Installs a test-friendly subscriber; `RUST_LOG=chaperone=debug` shows
/// what the crate is doing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `/bin/sh -c <script>`.
pub fn sh(script: &str) -> ChildBuilder {
    init_tracing();
    let mut cmd = ChildBuilder::new(SH);
    cmd.arg("-c").arg(script);
    cmd
}

/// Reads `stream` until `done` accepts the accumulated bytes, end of
/// file, or `limit` elapses. Returns everything read.
pub fn read_until(
    child: &mut Child,
    stream: Output,
    limit: Duration,
    done: impl Fn(&[u8]) -> bool,
) -> Vec<u8> {
    let give_up = Instant::now() + limit;
    let mut got = Vec::new();
    while !done(&got) {
        let left = give_up.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match child.read(stream, Timeout::from(left)) {
            Ok(bytes) => got.extend(bytes),
            Err(Error::EndOfStream(_)) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    got
}

/// Reads until end of file.
pub fn read_to_end(child: &mut Child, stream: Output) -> Vec<u8> {
    let got = read_until(child, stream, Duration::from_secs(10), |_| false);
    assert!(child.is_eof(stream), "no EOF on {stream:?} within 10s");
    got
}

/// Reads until a full line has arrived.
pub fn read_line(child: &mut Child, stream: Output) -> Vec<u8> {
    read_until(child, stream, Duration::from_secs(5), |b| b.ends_with(b"\n"))
}
