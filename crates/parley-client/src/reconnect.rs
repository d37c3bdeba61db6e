use std::time::Duration;

use parley_settings::ReconnectSettings;
use rand::Rng;

/// Backoff-retry policy for failed or lost connections.
///
/// - Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`
/// - Jitter: `delay * (1 ± jitter_factor)`, never below 50ms
/// - Only retryable transport failures are retried (see `TransportError::is_retryable`)
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl ReconnectPolicy {
    /// A single connection attempt, never retried.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn backoff(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            enabled: true,
            max_attempts,
            base_delay,
            max_delay,
            jitter_factor: 0.2,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// policy gives up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt >= self.max_attempts {
            return None;
        }
        Some(self.delay_for(attempt))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(50.0);

        Duration::from_millis(final_ms as u64)
    }
}
