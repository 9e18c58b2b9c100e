//! Shared request limiter for the embedding capability.
//!
//! Fixed-window semantics: at most `per_minute` permits are handed out in
//! any one-minute window; callers over the budget sleep until the window
//! rolls over. One limiter instance is shared (via `Arc`) by all concurrent
//! document workers, so throttling is global to the run. The internal lock
//! is never held across an `.await`.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    per_minute: u32,
    window: Mutex<Window>,
}

struct Window {
    started: Instant,
    used: u32,
}

impl RateLimiter {
    /// `per_minute == 0` disables throttling entirely.
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Take one permit, sleeping until the current window expires if the
    /// budget is spent.
    pub async fn acquire(&self) {
        if self.per_minute == 0 {
            return;
        }

        loop {
            let wait = {
                let mut w = self.window.lock().await;
                let now = Instant::now();
                if now.duration_since(w.started) >= WINDOW {
                    w.started = now;
                    w.used = 0;
                }
                if w.used < self.per_minute {
                    w.used += 1;
                    return;
                }
                WINDOW - now.duration_since(w.started)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
