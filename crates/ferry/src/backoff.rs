// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::min;
use std::time::Duration;

use crate::rnd::Rnd;

/// The factor used to determine the range of jitter applied to delays.
const JITTER_FACTOR: f64 = 0.5;

/// Computes how long to wait before an attempt.
///
/// The orchestrator calls the policy only between a retry decision and the next attempt, never
/// before the first attempt. `attempt_index` is the 1-based number of the attempt about to start,
/// so the first retry asks for index 2.
///
/// Any `Fn(u32) -> Duration + Send + Sync` closure is a backoff policy.
pub trait BackoffPolicy: Send + Sync {
    /// Returns the delay before attempt number `attempt_index`.
    fn delay_before(&self, attempt_index: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay_before(&self, attempt_index: u32) -> Duration {
        self(attempt_index)
    }
}

/// Retries immediately.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay_before(&self, _attempt_index: u32) -> Duration {
        Duration::ZERO
    }
}

/// How [`DelayBackoff`] grows the delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Backoff {
    /// Every retry waits the base delay.
    ///
    /// Example with `2s` base delay: `2s, 2s, 2s, ...`
    Constant,

    /// The delay grows by the base delay with each retry.
    ///
    /// Example with `2s` base delay: `2s, 4s, 6s, ...`
    Linear,

    /// The delay doubles with each retry.
    ///
    /// Example with `2s` base delay: `2s, 4s, 8s, ...`
    Exponential,
}

/// A growing delay with an optional cap and jitter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use ferry::{Backoff, BackoffPolicy, DelayBackoff};
///
/// let backoff = DelayBackoff::new(Backoff::Exponential, Duration::from_millis(100))
///     .max_delay(Duration::from_millis(250));
///
/// assert_eq!(backoff.delay_before(2), Duration::from_millis(100));
/// assert_eq!(backoff.delay_before(3), Duration::from_millis(200));
/// assert_eq!(backoff.delay_before(4), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct DelayBackoff {
    backoff: Backoff,
    base_delay: Duration,
    max_delay: Option<Duration>,
    use_jitter: bool,
    rnd: Rnd,
}

impl DelayBackoff {
    /// Creates a backoff without jitter or cap.
    #[must_use]
    pub fn new(backoff: Backoff, base_delay: Duration) -> Self {
        Self {
            backoff,
            base_delay,
            max_delay: None,
            use_jitter: false,
            rnd: Rnd::default(),
        }
    }

    /// Caps every delay.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Randomizes each delay within a window of 50% of the delay centered on it, so the
    /// result lies between 75% and 125% of the delay.
    #[must_use]
    pub fn use_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    #[cfg(test)]
    fn rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }
}

impl BackoffPolicy for DelayBackoff {
    fn delay_before(&self, attempt_index: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        // Index 2 is the first retry.
        let retry = attempt_index.saturating_sub(1).max(1);

        let delay = match self.backoff {
            Backoff::Constant => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(retry),
            Backoff::Exponential => duration_mul_pow2(self.base_delay, retry - 1),
        };

        let delay = if self.use_jitter {
            apply_jitter(delay, &self.rnd)
        } else {
            delay
        };

        self.max_delay.map_or(delay, |max| min(delay, max))
    }
}

fn duration_mul_pow2(base: Duration, exponent: u32) -> Duration {
    2_u32
        .checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// Adds a symmetric, uniform jitter centered on `delay`; the result lies in
/// `[0.75 * delay, 1.25 * delay]`.
fn apply_jitter(delay: Duration, rnd: &Rnd) -> Duration {
    let ms = delay.as_secs_f64() * 1000.0;
    let offset = (ms * JITTER_FACTOR) / 2.0;
    let random_delay = (ms * JITTER_FACTOR).mul_add(rnd.next_f64(), -offset);

    secs_to_duration_saturating((ms + random_delay) / 1000.0)
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
