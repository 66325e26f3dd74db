//! Adaptive pacing for calls to a remote analyzer.
//!
//! The delay shrinks by 10% after every run of more than ten successes and
//! grows by 20% (50% once errors are sustained) after each failure, always
//! staying within `[min_delay, max_delay]`.

use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::sync::Mutex;

const SUCCESS_STREAK: u32 = 10;
const SPEEDUP_FACTOR: f64 = 0.9;
const MILD_BACKOFF: f64 = 1.2;
const SEVERE_BACKOFF: f64 = 1.5;
const SEVERE_AFTER_ERRORS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
struct LimiterState {
    delay: f64,
    success_count: u32,
    consecutive_errors: u32,
}

#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    min_delay: f64,
    max_delay: f64,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    /// Non-finite or inverted bounds are repaired: `min_delay` is at least 0
    /// and `max_delay` is at least `min_delay`.
    pub fn new(initial_delay: f64, min_delay: f64, max_delay: f64) -> Self {
        let (lo, hi) = sanitize_bounds(min_delay, max_delay);
        if (lo, hi) != (min_delay, max_delay) {
            log::warn!(
                "Invalid rate limit bounds [{}, {}], using [{}, {}]",
                min_delay,
                max_delay,
                lo,
                hi
            );
        }
        let delay = if initial_delay.is_finite() {
            initial_delay.clamp(lo, hi)
        } else {
            lo
        };
        Self {
            min_delay: lo,
            max_delay: hi,
            state: Mutex::new(LimiterState {
                delay,
                success_count: 0,
                consecutive_errors: 0,
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.initial_delay, config.min_delay, config.max_delay)
    }

    pub async fn current_delay(&self) -> f64 {
        self.state.lock().await.delay
    }

    /// Sleeps for the current delay. Does not touch the state.
    pub async fn wait(&self) {
        let delay = self.current_delay().await;
        log::trace!("Rate limiting: waiting {:.3}s", delay);
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    pub async fn record_outcome(&self, success: bool) {
        let mut state = self.state.lock().await;
        if success {
            state.success_count += 1;
            state.consecutive_errors = 0;
            if state.success_count > SUCCESS_STREAK {
                state.delay = (state.delay * SPEEDUP_FACTOR).max(self.min_delay);
                state.success_count = 0;
                log::debug!("Sustained success, delay lowered to {:.3}s", state.delay);
            }
        } else {
            state.consecutive_errors += 1;
            state.success_count = 0;
            let factor = if state.consecutive_errors > SEVERE_AFTER_ERRORS {
                SEVERE_BACKOFF
            } else {
                MILD_BACKOFF
            };
            state.delay = (state.delay * factor).min(self.max_delay);
            log::debug!(
                "Analyzer error #{} in a row, delay raised to {:.3}s",
                state.consecutive_errors,
                state.delay
            );
        }
    }

    /// Overrides the delay, e.g. from a user-supplied setting.
    pub async fn set_delay(&self, seconds: f64) {
        if !seconds.is_finite() {
            log::warn!("Ignoring non-finite rate limit delay {}", seconds);
            return;
        }
        let mut state = self.state.lock().await;
        state.delay = seconds.clamp(self.min_delay, self.max_delay);
    }
}

fn sanitize_bounds(min_delay: f64, max_delay: f64) -> (f64, f64) {
    let lo = if min_delay.is_finite() { min_delay.max(0.0) } else { 0.0 };
    let hi = if max_delay.is_finite() { max_delay.max(lo) } else { lo };
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bounds_after_long_streaks() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 60.0);
        for _ in 0..100 {
            limiter.record_outcome(false).await;
        }
        assert_eq!(limiter.current_delay().await, 60.0);

        // Only every eleventh success shrinks the delay.
        for _ in 0..1100 {
            limiter.record_outcome(true).await;
        }
        assert_eq!(limiter.current_delay().await, 0.1);
    }

    #[tokio::test]
    async fn test_first_errors_back_off_mildly() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 60.0);
        limiter.record_outcome(false).await;
        assert!((limiter.current_delay().await - 1.2).abs() < 1e-9);
        limiter.record_outcome(false).await;
        assert!((limiter.current_delay().await - 1.44).abs() < 1e-9);
        limiter.record_outcome(false).await;
        assert!((limiter.current_delay().await - 2.16).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_speedup_needs_more_than_ten_successes() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 60.0);
        for _ in 0..10 {
            limiter.record_outcome(true).await;
        }
        assert_eq!(limiter.current_delay().await, 1.0);
        limiter.record_outcome(true).await;
        assert!((limiter.current_delay().await - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_success_resets_error_streak() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 60.0);
        limiter.record_outcome(false).await;
        limiter.record_outcome(false).await;
        limiter.record_outcome(true).await;
        limiter.record_outcome(false).await;
        // 1.0 * 1.2 * 1.2 * 1.2, the streak restarted so no 1.5 step.
        assert!((limiter.current_delay().await - 1.728).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_concurrent_updates_stay_in_bounds() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(1.0, 0.5, 2.0));
        let mut handles = Vec::new();
        for i in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.record_outcome(i % 3 == 0).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let delay = limiter.current_delay().await;
        assert!((0.5..=2.0).contains(&delay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_current_delay() {
        let limiter = AdaptiveRateLimiter::new(2.0, 0.1, 60.0);
        let start = tokio::time::Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(limiter.current_delay().await, 2.0);
    }

    #[tokio::test]
    async fn test_inverted_bounds_do_not_panic() {
        let limiter = AdaptiveRateLimiter::new(1.0, 5.0, 2.0);
        assert_eq!(limiter.current_delay().await, 5.0);

        limiter.set_delay(100.0).await;
        assert_eq!(limiter.current_delay().await, 5.0);
        limiter.record_outcome(false).await;
        assert_eq!(limiter.current_delay().await, 5.0);
    }

    #[tokio::test]
    async fn test_non_finite_inputs_are_ignored() {
        let limiter = AdaptiveRateLimiter::new(f64::NAN, f64::NAN, 10.0);
        assert_eq!(limiter.current_delay().await, 0.0);

        limiter.set_delay(3.0).await;
        limiter.set_delay(f64::NAN).await;
        limiter.set_delay(f64::INFINITY).await;
        assert_eq!(limiter.current_delay().await, 3.0);
    }
}
