use std::time::Duration;
use tokio::time::Instant;

/// Election deadline.
///
/// Resetting pushes the deadline forward; the ticker compares the deadline
/// against the clock when it wakes, so a reset that races with a wake-up
/// can never be lost.
#[derive(Debug, Clone)]
pub struct WatchDog {
    deadline: Instant,
}

impl WatchDog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn reset(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
