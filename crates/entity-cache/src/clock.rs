use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

/// A point in time as seen by a single [`Clock`], in microseconds.
///
/// `0` is never handed out, so it can be used as a "never happened" marker.
pub type Timestamp = u64;

/// Strictly monotonic per-cache clock.
///
/// Every call to [`now`](Self::now) returns a value larger than any previously returned one,
/// even when the underlying time source did not move. Comparisons like "accessed after it
/// was persisted" therefore never tie.
///
/// Time is measured with [`tokio::time::Instant`], which means tests running with a paused
/// runtime can drive the clock with `tokio::time::advance`.
#[derive(Debug)]
pub struct Clock {
    epoch: Instant,
    last: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> Timestamp {
        let elapsed = self.epoch.elapsed().as_micros() as u64 + 1;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = elapsed.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Returns the timestamp lying `micros` before now, saturating at zero.
    pub fn micros_ago(&self, micros: u64) -> Timestamp {
        self.now().saturating_sub(micros)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_never_zero_and_strictly_increasing() {
        let clock = Clock::new();
        let mut previous = 0;
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now > previous);
            previous = now;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(2)).await;
        let after = clock.now();
        assert!(after - before >= 2_000_000);
    }
}
