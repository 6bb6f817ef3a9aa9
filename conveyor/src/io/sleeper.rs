//! Blocking sleep seam for rate-limit backoff.

use std::thread;
use std::time::Duration;

use tracing::info;

/// Blocking wait used for rate-limit backoff.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        info!(secs = duration.as_secs(), "backing off");
        thread::sleep(duration);
    }
}
