use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A token bucket whose whole state is one atomic word.
///
/// The bucket stores the theoretical arrival time (TAT) of the next request,
/// in nanoseconds since the owning controller's epoch. Admitting a request
/// pushes the TAT forward by one emission interval; a request is refused if
/// that would put the TAT more than `capacity` intervals ahead of now. This is
/// exactly a bucket of `capacity` tokens refilled linearly at one token per
/// interval.
#[derive(Debug)]
pub struct RateBucket {
    capacity: u32,
    interval_nanos: u64,
    tat: AtomicU64,
}

impl RateBucket {
    /// A full bucket holding `capacity` tokens which are refilled at a rate of
    /// `capacity` per `period`.
    pub fn new(capacity: u32, period: Duration) -> Self {
        let capacity = capacity.max(1);
        let period_nanos = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
        let interval_nanos = (period_nanos / u64::from(capacity)).max(1);
        Self {
            capacity,
            interval_nanos,
            tat: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Try to take one token at time `now`. On refusal, returns how long the
    /// caller must wait for the next token.
    pub fn try_acquire(&self, now: u64) -> Result<(), Duration> {
        let burst = self.interval_nanos.saturating_mul(u64::from(self.capacity));
        let mut current = self.tat.load(Ordering::Acquire);
        loop {
            let next = current.max(now).saturating_add(self.interval_nanos);
            let ahead = next - now;
            if ahead > burst {
                return Err(Duration::from_nanos(ahead - burst));
            }
            match self
                .tat
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Tokens available at time `now`.
    pub fn available_tokens(&self, now: u64) -> u32 {
        let tat = self.tat.load(Ordering::Acquire);
        if tat <= now {
            return self.capacity;
        }
        let used = (tat - now).div_ceil(self.interval_nanos);
        let used = u32::try_from(used).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(used)
    }

    /// Whether the bucket has been completely full for at least `idle` at
    /// time `now`. Such a bucket is indistinguishable from a fresh one.
    pub fn idle_for(&self, now: u64, idle: Duration) -> bool {
        let idle = u64::try_from(idle.as_nanos()).unwrap_or(u64::MAX);
        self.tat.load(Ordering::Acquire).saturating_add(idle) <= now
    }
}
