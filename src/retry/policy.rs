//! Retry policy types and configuration.

use std::time::Duration;

use crate::failure::Failure;

/// A retry policy describing how many times, and how far apart, a failed
/// request is attempted again.
///
/// Policies are pure data: they describe retry behavior but don't execute it.
/// Whether a given failure is retryable at all is decided by the caller of
/// the executor, not by the policy.
///
/// `max_retries` does not include the initial attempt and defaults to `0`
/// (no retries).
///
/// # Examples
///
/// ```rust
/// use paysub::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(Duration::from_millis(100))
///     .with_max_retries(3);
///
/// assert_eq!(policy.max_retries(), 3);
/// assert_eq!(policy.delay(2), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    #[cfg_attr(feature = "serde", serde(default))]
    max_retries: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    max_delay: Option<Duration>,
}

/// The backoff strategy for retry delays.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RetryStrategy {
    /// Fixed delay between attempts.
    Constant(Duration),
    /// Delay increases linearly: base * (attempt + 1).
    Linear {
        /// Base delay duration.
        base: Duration,
    },
    /// Delay grows geometrically: base * rate^attempt.
    Exponential {
        /// Base delay duration.
        base: Duration,
        /// Growth factor applied per attempt.
        rate: u32,
    },
    /// Delay follows Fibonacci sequence: fib(attempt + 1) * base.
    Fibonacci {
        /// Base delay duration.
        base: Duration,
    },
}

/// Information about a failed attempt, passed to retry observers.
#[derive(Debug, Clone)]
pub struct RetryEvent<'a> {
    /// Which attempt just failed (1-indexed).
    pub attempt: u32,
    /// The failure from the failed attempt.
    pub failure: &'a Failure,
    /// Delay before next attempt, or `None` if the call is giving up.
    pub next_delay: Option<Duration>,
    /// Total elapsed time since the call started.
    pub elapsed: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::constant(Duration::ZERO)
    }

    /// Create a policy with constant delay between retries.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paysub::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::constant(Duration::from_millis(500))
    ///     .with_max_retries(3);
    ///
    /// assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(500)));
    /// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(500)));
    /// assert_eq!(policy.delay_for_attempt(3), None); // max_retries exceeded
    /// ```
    pub fn constant(delay: Duration) -> Self {
        Self::with_strategy(RetryStrategy::Constant(delay))
    }

    /// Create a policy with linearly increasing delay.
    ///
    /// Delay = base * (attempt + 1)
    pub fn linear(base: Duration) -> Self {
        Self::with_strategy(RetryStrategy::Linear { base })
    }

    /// Create a policy whose delay doubles on every attempt.
    ///
    /// Delay = base * 2^attempt
    ///
    /// # Examples
    ///
    /// ```rust
    /// use paysub::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::exponential(Duration::from_millis(100))
    ///     .with_max_retries(5);
    ///
    /// // Delay doubles: 100ms, 200ms, 400ms, 800ms, 1600ms
    /// assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(100)));
    /// assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(200)));
    /// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(400)));
    /// ```
    pub fn exponential(base: Duration) -> Self {
        Self::exponential_with_rate(base, 2)
    }

    /// Create a policy whose delay is multiplied by `rate` on every attempt.
    ///
    /// Delay = base * rate^attempt. A rate below 1 is treated as 1.
    pub fn exponential_with_rate(base: Duration, rate: u32) -> Self {
        Self::with_strategy(RetryStrategy::Exponential {
            base,
            rate: rate.max(1),
        })
    }

    /// Create a policy with Fibonacci-based delay.
    ///
    /// Delay = base * fib(attempt + 1)
    pub fn fibonacci(base: Duration) -> Self {
        Self::with_strategy(RetryStrategy::Fibonacci { base })
    }

    fn with_strategy(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            max_retries: 0,
            max_delay: None,
        }
    }

    /// Set the maximum number of retry attempts.
    ///
    /// This does not include the initial attempt. For example,
    /// `with_max_retries(3)` means up to 4 dispatches in total.
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the maximum delay cap.
    ///
    /// Delays will never exceed this value, regardless of the backoff strategy.
    ///
    /// ```rust
    /// use paysub::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::exponential(Duration::from_millis(100))
    ///     .with_max_retries(10)
    ///     .with_max_delay(Duration::from_secs(1));
    ///
    /// assert_eq!(policy.delay(3), Duration::from_millis(800));
    /// assert_eq!(policy.delay(4), Duration::from_secs(1));
    /// ```
    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = Some(d);
        self
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the maximum delay cap.
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Get the retry strategy.
    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Delay to wait after the failure of attempt `attempt` (0-indexed).
    ///
    /// Callers only ask for attempts below [`max_retries`](Self::max_retries);
    /// use [`delay_for_attempt`](Self::delay_for_attempt) when that is not
    /// already known.
    pub fn delay(&self, attempt: u32) -> Duration {
        debug_assert!(
            attempt < self.max_retries,
            "retry delay requested for attempt {attempt} beyond max_retries {}",
            self.max_retries
        );
        self.backoff(attempt)
    }

    /// Calculate the delay before retry N (0-indexed).
    ///
    /// Returns None if no more retries should be attempted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.backoff(attempt))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base_delay = match &self.strategy {
            RetryStrategy::Constant(d) => *d,
            RetryStrategy::Linear { base } => base.saturating_mul(attempt.saturating_add(1)),
            RetryStrategy::Exponential { base, rate } => {
                base.saturating_mul(rate.saturating_pow(attempt))
            }
            RetryStrategy::Fibonacci { base } => {
                base.saturating_mul(fibonacci(attempt.saturating_add(1)))
            }
        };

        match self.max_delay {
            Some(max) => base_delay.min(max),
            None => base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Calculate the nth Fibonacci number.
fn fibonacci(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    let mut a = 0u32;
    let mut b = 1u32;
    for _ in 1..n {
        let temp = a.saturating_add(b);
        a = b;
        b = temp;
    }
    b
}
