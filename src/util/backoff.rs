use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const MAX_BACKOFF_MILLIS: u64 = 4 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay applied as random jitter in both
    /// directions. `0.0` yields exact exponential delays.
    pub random_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MILLIS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(MAX_BACKOFF_MILLIS),
            random_factor: 0.0,
        }
    }
}

/// Delay to wait after the `failures`-th consecutive failure (1-based):
/// `base * factor^(failures - 1)`, capped at `max_delay`.
pub fn calculate_backoff(failures: u32, config: BackoffConfig) -> Duration {
    calculate_backoff_with_rng(failures, config, &mut rand::thread_rng())
}

fn calculate_backoff_with_rng<R: Rng + ?Sized>(
    failures: u32,
    config: BackoffConfig,
    rng: &mut R,
) -> Duration {
    let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base = (config.base_delay.as_millis() as f64) * config.backoff_factor.powi(exponent);
    let jitter = if config.random_factor > 0.0 {
        config.random_factor * base * rng.gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    let cap = config.max_delay.as_millis().min(MAX_BACKOFF_MILLIS as u128) as f64;
    let value = (base + jitter).round().clamp(0.0, cap);
    Duration::from_millis(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(base_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn doubles_per_failure() {
        let delays: Vec<_> = (1..=3).map(|n| calculate_backoff(n, config(100))).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn caps_at_max_delay() {
        let capped = BackoffConfig {
            max_delay: Duration::from_millis(250),
            ..config(100)
        };
        assert_eq!(calculate_backoff(10, capped), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let jittered = BackoffConfig {
            random_factor: 0.5,
            ..config(1_000)
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let value = calculate_backoff_with_rng(1, jittered, &mut rng);
            assert!(value >= Duration::from_millis(500));
            assert!(value <= Duration::from_millis(1_500));
        }
    }
}
