use std::time::Instant;

use tracing::debug;

// Utility for time-tracking of acquisition phases
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the previous tick (or creation).
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, action: &str, msg: &str) -> f64 {
        let diff = self.tick();
        debug!(action, "{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}
