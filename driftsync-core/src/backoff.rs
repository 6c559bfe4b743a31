use std::time::Duration;

use rand::Rng;

/// Jittered exponential delay between retries of a transient chunk failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let capped = base_ms
            .checked_shl(attempt.min(16))
            .unwrap_or(u64::MAX)
            .min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delay_without_jitter_doubles_up_to_max() {
        let backoff = RetryBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
            false,
        );
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            backoff.delay_with_rng(0, &mut rng),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.delay_with_rng(1, &mut rng),
            Duration::from_millis(200)
        );
        assert_eq!(
            backoff.delay_with_rng(2, &mut rng),
            Duration::from_millis(400)
        );
        assert_eq!(
            backoff.delay_with_rng(9, &mut rng),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn jittered_delay_stays_within_half_open_window() {
        let backoff = RetryBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            true,
        );
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }
}
