//! Global ceiling on instance starts across all agents.

use std::time::Duration;

use tokio::time::Instant;

/// Fixed window counter shared by every agent's lifecycle.
#[derive(Debug)]
pub struct RateWindow {
    count: u32,
    window_start: Instant,
    window: Duration,
    max_per_window: u32,
}

impl RateWindow {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            window,
            max_per_window,
        }
    }

    /// Start a new window if the current one has elapsed.
    pub fn reset_if_expired(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.window_start) > self.window {
            self.count = 0;
            self.window_start = now;
        }
    }

    /// Check-and-increment. Returns false when the window is exhausted.
    pub fn try_acquire(&mut self) -> bool {
        self.reset_if_expired();
        if self.count >= self.max_per_window {
            return false;
        }
        self.count += 1;
        true
    }

    /// Time until the current window expires and starts are admitted again.
    pub fn retry_after(&self) -> Duration {
        let elapsed = Instant::now().duration_since(self.window_start);
        // The window resets only once strictly more than `window` has passed.
        (self.window + Duration::from_millis(1)).saturating_sub(elapsed)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
