// When to write a page session's state back to the store.
//
// The first change after a clean flush arms a deadline `debounce` ahead;
// later changes ride along instead of pushing it back, so a page under
// constant editing still flushes once per window. A failed flush re-arms
// the deadline with exponential backoff plus jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Exponent cap; keeps `base << attempt` from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 7;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exp).min(max)
}

#[derive(Debug)]
pub(crate) struct FlushSchedule {
    debounce: Duration,
    retry_base: Duration,
    retry_max: Duration,
    deadline: Option<Instant>,
    failures: u32,
}

impl FlushSchedule {
    pub(crate) fn new(debounce: Duration, retry_base: Duration, retry_max: Duration) -> Self {
        Self { debounce, retry_base, retry_max, deadline: None, failures: 0 }
    }

    /// Record unsaved state.
    pub(crate) fn mark_dirty(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.debounce);
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn succeeded(&mut self) {
        self.deadline = None;
        self.failures = 0;
    }

    /// Schedule a retry and return how long until it fires.
    pub(crate) fn failed(&mut self, now: Instant) -> Duration {
        let delay = backoff_delay(self.failures, self.retry_base, self.retry_max);
        let jitter_ceiling = (delay.as_millis() as u64 / 4).max(1);
        let delay = delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling));
        self.failures = self.failures.saturating_add(1);
        self.deadline = Some(now + delay);
        delay
    }
}
