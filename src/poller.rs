use std::time::{Duration, Instant};

/// First sleep between two probes of a condition the OS cannot wait on
/// directly. Doubles up to [`MAX_BACKOFF`].
const MIN_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// How long a poll, wait or read may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Check the current state and return.
    Immediate,
    /// Block until the awaited condition holds.
    Forever,
    /// Block for at most this long.
    After(Duration),
}

impl Timeout {
    /// Maps the integer convention used by bindings: `0` checks without
    /// waiting, any negative value blocks, a positive value is a bound in
    /// milliseconds.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::Immediate,
            ms if ms < 0 => Self::Forever,
            ms => Self::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    pub fn millis(ms: u64) -> Self {
        Self::from(Duration::from_millis(ms))
    }

    pub(crate) fn deadline(self) -> Deadline {
        match self {
            Self::Immediate => Deadline(Some(Instant::now())),
            Self::Forever => Deadline(None),
            Self::After(d) => Deadline(Instant::now().checked_add(d)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::Immediate
        } else {
            Self::After(d)
        }
    }
}

/// A point in time after which a blocking call must return. `None`
/// never expires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    /// Time left before expiry, `None` if unbounded.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

/// Calls `probe` until it yields a value or `timeout` runs out, sleeping
/// with exponential backoff in between. The probe always runs at least
/// once, and once more right at the deadline.
pub(crate) fn probe_until<T, E>(
    timeout: Timeout,
    mut probe: impl FnMut() -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    let deadline = timeout.deadline();
    let mut backoff = MIN_BACKOFF;
    loop {
        if let Some(found) = probe()? {
            return Ok(Some(found));
        }
        let nap = match deadline.remaining() {
            Some(left) if left.is_zero() => return Ok(None),
            Some(left) => left.min(backoff),
            None => backoff,
        };
        std::thread::sleep(nap);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::convert::Infallible;

    #[test]
    fn integer_convention() {
        assert_eq!(Timeout::from_millis(0), Timeout::Immediate);
        assert_eq!(Timeout::from_millis(-1), Timeout::Forever);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::After(Duration::from_millis(250))
        );
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::Immediate);
    }

    #[test]
    fn immediate_probes_exactly_once() {
        let mut calls = 0;
        let found = probe_until(Timeout::Immediate, || {
            calls += 1;
            Ok::<Option<()>, Infallible>(None)
        })
        .unwrap();
        assert!(found.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn bounded_probe_respects_the_bound() {
        let start = Instant::now();
        let found = probe_until(Timeout::millis(80), || Ok::<Option<()>, Infallible>(None)).unwrap();
        let elapsed = start.elapsed();
        assert!(found.is_none());
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[test]
    fn forever_returns_once_the_probe_succeeds() {
        let mut calls = 0;
        let found = probe_until(Timeout::Forever, || {
            calls += 1;
            Ok::<_, Infallible>((calls == 5).then_some(calls))
        })
        .unwrap();
        assert_eq!(found, Some(5));
    }

    #[test]
    fn probe_errors_propagate() {
        let res: Result<Option<()>, &str> = probe_until(Timeout::Forever, || Err("gone"));
        assert_eq!(res, Err("gone"));
    }

    proptest! {
        #[test]
        fn positive_millis_are_bounded(ms in 1i64..=i64::MAX) {
            prop_assert_eq!(
                Timeout::from_millis(ms),
                Timeout::After(Duration::from_millis(ms as u64))
            );
        }

        #[test]
        fn negative_millis_block(ms in i64::MIN..0) {
            prop_assert_eq!(Timeout::from_millis(ms), Timeout::Forever);
        }
    }
}
