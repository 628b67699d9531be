//! Reconnection policy
//!
//! Fixed delay between attempts by default. A multiplier above 1.0 turns it
//! into capped exponential backoff, and `max_attempts` bounds consecutive
//! failures before the client gives up.

use std::time::Duration;

/// Configuration for reconnection behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    pub delay: Duration,
    /// Factor applied to the delay after each attempt (1.0 = fixed)
    pub multiplier: f64,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Maximum number of consecutive attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_delay: Duration::from_secs(300),
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay, unlimited attempts
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            ..Self::default()
        }
    }
}

/// Decides when the next reconnection attempt happens
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_tether::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_secs(5)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
/// assert_eq!(policy.attempt_count(), 2);
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.delay;
        Self {
            config,
            current_delay: delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, counting it
    ///
    /// Returns `None` once `max_attempts` attempts have been handed out.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.current_delay;

        let scaled = self.current_delay.as_secs_f64() * self.config.multiplier;
        let next = if scaled.is_finite() && scaled > 0.0 {
            Duration::try_from_secs_f64(scaled).unwrap_or(self.config.max_delay)
        } else {
            Duration::ZERO
        };
        self.current_delay = next.min(self.config.max_delay.max(self.config.delay));

        Some(delay)
    }

    /// Reset the policy after a successful connection
    pub fn reset(&mut self) {
        self.current_delay = self.config.delay;
        self.attempt_count = 0;
    }

    /// Get the current attempt count
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }
}
