//! Timers and retry policies shared by every component.
//!
//! - [`Debouncer`]: cancelable one-shot timer; re-arming cancels the
//!   pending timer (autosave coalescing, reconnect backoff).
//! - [`PeriodicTask`]: fixed-interval background task (heartbeat, snapshot
//!   cadence, retention sweep).
//! - [`RetryPolicy`]: bounded retries with a fixed or linearly increasing
//!   delay.
//! - [`SingleFlight`]: rejects a second caller while one run is active.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `step * n` before retry `n`, never more than `max`.
    Linear { step: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step, max } => step.saturating_mul(retry.max(1)).min(max),
        }
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
}

/// Every attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn linear(max_retries: u32, step: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear { step, max },
        }
    }

    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.backoff.delay_for_retry(retry)
    }

    /// Whether retry number `retry` (1-based) is still allowed.
    pub fn allows_retry(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Run `op` until it succeeds or the retry budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retry = attempt;
                    if !self.allows_retry(retry) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    let delay = self.delay_for_retry(retry);
                    log::warn!("Attempt {attempt} failed ({e}); retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Cancelable one-shot timer.
///
/// Only the waiting phase is cancelable: once the delay elapses the action
/// runs on its own task and is not interrupted by a later `arm` or `cancel`.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the timer.
    pub fn arm<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(action());
        });
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancel the pending timer. Returns whether one was still waiting.
    pub fn cancel(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        match pending {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Background task ticking at a fixed period. Stops when dropped.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `tick` every `period`; the first run happens one period from now.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Guard for operations that must not overlap. A concurrent caller is
/// rejected, not queued.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot; `None` while another run holds it.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`SingleFlight`] slot when dropped.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn test_linear_backoff_is_capped() {
        let policy = RetryPolicy::linear(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(9), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_then_succeeds() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryExhausted<String>> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("fail {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_budget() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let result: Result<(), RetryExhausted<String>> =
            policy.run(|_| async { Err("nope".to_string()) }).await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last_error, "nope");
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_coalesces() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let fired = fired.clone();
            debouncer.arm(Duration::from_millis(1000), move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(debouncer.is_armed());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_cancel() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        debouncer.arm(Duration::from_millis(1000), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();
        let task = PeriodicTask::spawn(Duration::from_secs(30), move || {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_single_flight_rejects_overlap() {
        let flight = SingleFlight::new();
        let guard = flight.try_begin().unwrap();
        assert!(flight.is_busy());
        assert!(flight.try_begin().is_none());
        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_begin().is_some());
    }
}
