use std::time::Duration;

/// Linear retry backoff: attempt 1 waits `base`, attempt 2 waits `2 * base`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1))
    }
}
