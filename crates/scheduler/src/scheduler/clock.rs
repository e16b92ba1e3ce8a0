use std::time::{Duration, Instant};

/// Monotonic nanosecond clock, relative to the scheduler's creation.
///
/// Readings are plain `i64`s so deadlines can be stored atomically and
/// compared with [`after`], which tolerates wraparound.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    pub fn nano_time(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `now` is at or past `deadline`, treating both as points on a
/// wrapping 64-bit counter.
pub fn after(now: i64, deadline: i64) -> bool {
    now.wrapping_sub(deadline) >= 0
}

/// Saturating conversion of a [`Duration`] to signed nanoseconds.
pub fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
