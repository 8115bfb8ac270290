//! Reconnect backoff and the cancellable sleeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(500);
const FACTOR: f64 = 1.5;
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff with jitter: 500 ms × 1.5 per attempt, capped at
/// 30 s. Jitter scales each delay by a random factor in `[0.5, 1.5)`.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Back to the base delay; called on every successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = BASE_DELAY.as_millis() as f64 * FACTOR.powi(self.attempt as i32);
        let nominal = nominal.min(MAX_DELAY.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = 0.5 + rand::random::<f64>();
        let delay = Duration::from_millis((nominal * jitter) as u64);
        delay.min(MAX_DELAY)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellable sleep: `sleep` waits out the duration unless `wake` is
/// called, in which case it returns early. A wake issued while nobody is
/// sleeping is remembered and consumes the next sleep immediately.
pub struct Sleeper {
    notify: Arc<Notify>,
}

#[derive(Clone)]
pub struct WakeHandle {
    notify: Arc<Notify>,
}

impl Sleeper {
    pub fn new() -> (Self, WakeHandle) {
        let notify = Arc::new(Notify::new());
        (Self { notify: Arc::clone(&notify) }, WakeHandle { notify })
    }

    /// Returns `true` when woken before the duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.notify.notified() => true,
        }
    }
}

impl WakeHandle {
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}
