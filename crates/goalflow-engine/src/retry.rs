use std::time::Duration;

use rand::Rng;

use goalflow_core::config::RetryConfig;

/// Exponential backoff between task attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: if config.jitter.is_nan() {
                0.0
            } else {
                config.jitter.clamp(0.0, 1.0)
            },
        }
    }

    /// Delay before the attempt that follows retry number `retry_count`.
    ///
    /// `base_delay * 2^retry_count`, capped at the configured maximum, then
    /// scaled by a random factor in `1 ± jitter` when jitter is enabled.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let ms = 2u64
            .checked_pow(retry_count)
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms);

        if self.jitter == 0.0 {
            return Duration::from_millis(ms);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_millis((ms as f64 * factor).max(0.0) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, max: u64, jitter: f64) -> RetryConfig {
        RetryConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = Backoff::new(&config(1000, 60_000, 0.0));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = Backoff::new(&config(1000, 5000, 0.0));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(5000));
        // overflow saturates to the cap
        assert_eq!(backoff.delay_for(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::new(&config(1000, 60_000, 0.2));
        for _ in 0..100 {
            let ms = backoff.delay_for(1).as_millis();
            assert!((1600..=2400).contains(&ms), "delay {} out of band", ms);
        }
    }

    #[test]
    fn test_out_of_range_jitter_is_sanitised() {
        let nan = Backoff::new(&config(100, 1000, f64::NAN));
        assert_eq!(nan.delay_for(1), Duration::from_millis(200));

        let wide = Backoff::new(&config(100, 1000, 7.5));
        for _ in 0..50 {
            assert!(wide.delay_for(1) <= Duration::from_millis(400));
        }
    }
}
