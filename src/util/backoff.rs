use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::error::StoreResult;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, QueueFuture, TimerId};

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_MAX_DELAY_MILLIS,
        }
    }
}

/// Applies +/-50% jitter to the current backoff base.
pub fn jittered_delay_millis(base_millis: f64) -> u64 {
    jittered_delay_with_rng(base_millis, &mut rand::thread_rng())
}

fn jittered_delay_with_rng<R: Rng + ?Sized>(base_millis: f64, rng: &mut R) -> u64 {
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    (base_millis + jitter).round().max(0.0) as u64
}

/// Advances the backoff base by one attempt, clamped to the configured range.
pub fn next_base_millis(base_millis: f64, config: &BackoffConfig) -> f64 {
    (base_millis * config.backoff_factor).clamp(
        config.initial_delay_millis as f64,
        config.max_delay_millis as f64,
    )
}

/// Exponential backoff timer for stream reconnects.
///
/// The first run happens immediately; every subsequent run waits for the
/// previous delay multiplied by the backoff factor, with jitter. A successful
/// connection calls [`Self::reset`] so the next failure retries immediately
/// again, while resource-exhausted responses call [`Self::reset_to_max`].
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    config: BackoffConfig,
    current_base_millis: Mutex<f64>,
    timer: Mutex<Option<DelayedOperation>>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId, config: BackoffConfig) -> Self {
        Self {
            queue,
            timer_id,
            config,
            current_base_millis: Mutex::new(0.0),
            timer: Mutex::new(None),
        }
    }

    /// Schedules `op` on the queue after the current backoff delay and
    /// advances the delay for the next attempt. Cancels any attempt already
    /// pending for this timer id.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn backoff_and_run<O>(&self, op: O)
    where
        O: FnOnce() -> QueueFuture<StoreResult<()>> + Send + 'static,
    {
        self.cancel();
        let delay_millis = self.advance_delay_millis();
        if delay_millis > 0 {
            log::debug!("Backoff: running {:?} in {delay_millis} ms", self.timer_id);
        }
        let handle =
            self.queue
                .enqueue_after_delay(self.timer_id, Duration::from_millis(delay_millis), op);
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// Schedules `op` on the queue after the current backoff delay and
    /// advances the delay for the next attempt. Cancels any attempt already
    /// pending for this timer id.
    #[cfg(target_arch = "wasm32")]
    pub fn backoff_and_run<O>(&self, op: O)
    where
        O: FnOnce() -> QueueFuture<StoreResult<()>> + 'static,
    {
        self.cancel();
        let delay_millis = self.advance_delay_millis();
        if delay_millis > 0 {
            log::debug!("Backoff: running {:?} in {delay_millis} ms", self.timer_id);
        }
        let handle =
            self.queue
                .enqueue_after_delay(self.timer_id, Duration::from_millis(delay_millis), op);
        *self.timer.lock().unwrap() = Some(handle);
    }

    pub fn reset(&self) {
        *self.current_base_millis.lock().unwrap() = 0.0;
    }

    pub fn reset_to_max(&self) {
        *self.current_base_millis.lock().unwrap() = self.config.max_delay_millis as f64;
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    fn advance_delay_millis(&self) -> u64 {
        let mut base = self.current_base_millis.lock().unwrap();
        let delay = jittered_delay_with_rng(*base, &mut rand::thread_rng());
        *base = next_base_millis(*base, &self.config);
        delay
    }
}
