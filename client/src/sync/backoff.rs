use std::time::Duration;

use rand::Rng;

/// How a channel retries after a transient failure.
/// Defaults: unlimited attempts, 1s base delay, doubling, capped at 30s, no jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay to randomly add or subtract (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Whether the 1-based `attempt` is still permitted.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay before the 1-based `attempt`: `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_secs = self.max_delay.as_secs_f64();
        let raw = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let mut secs = if raw.is_finite() { raw.min(max_secs) } else { max_secs };

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-jitter..=jitter);
            secs = (secs * (1.0 + spread)).clamp(0.0, max_secs);
        }

        Duration::from_secs_f64(secs)
    }
}
