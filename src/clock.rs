//! Injectable time source (§6 `Clock`).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Abstract time source, injected everywhere the crate needs "now" so tests
/// can control elapsed time deterministically.
pub trait Clock: Send + Sync {
    /// A monotonic instant, unaffected by wall-clock adjustments.
    fn now_monotonic(&self) -> Instant;

    /// The current wall-clock time.
    fn now_wall(&self) -> DateTime<Utc>;
}

/// Default [`Clock`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`Clock`] whose wall and monotonic time can be advanced by the test that
/// owns it, without sleeping.
///
/// Lets tests assert expiry and refresh-timing behavior deterministically
/// instead of racing real sleeps against wall-clock jitter.
#[derive(Debug, Clone)]
pub struct FakeClock {
    state: std::sync::Arc<parking_lot::Mutex<FakeClockState>>,
}

#[derive(Debug)]
struct FakeClockState {
    monotonic_origin: Instant,
    elapsed: Duration,
    wall: DateTime<Utc>,
}

impl FakeClock {
    /// Create a fake clock starting at the given wall-clock time.
    pub fn new(start: DateTime<Utc>) -> Self {
        FakeClock {
            state: std::sync::Arc::new(parking_lot::Mutex::new(FakeClockState {
                monotonic_origin: Instant::now(),
                elapsed: Duration::ZERO,
                wall: start,
            })),
        }
    }

    /// Advance both the monotonic and wall clocks by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.elapsed += duration;
        state.wall += chrono::Duration::from_std(duration).unwrap_or_default();
    }
}

impl Clock for FakeClock {
    fn now_monotonic(&self) -> Instant {
        let state = self.state.lock();
        state.monotonic_origin + state.elapsed
    }

    fn now_wall(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_both_axes() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        let m0 = clock.now_monotonic();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_wall(), start + chrono::Duration::seconds(5));
        assert_eq!(clock.now_monotonic(), m0 + Duration::from_secs(5));
    }
}
