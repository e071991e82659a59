//! Exponential backoff with jitter for transient HTTP failures

use std::time::Duration;

use rand::Rng;

/// Backoff schedule for driver-level retries
///
/// Transient transport errors and throttling responses retry a few times
/// with exponentially growing, jittered delays before the error surfaces to
/// the scheduler's per-runbook boundary.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// 0.0-1.0 randomness factor applied to each delay
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(15),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before the given retry (1-based); `None` when attempts are
    /// exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let base = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Some(Duration::from_secs_f64(jittered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_exhausts() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay_for(1), Some(Duration::from_millis(500)));
        assert_eq!(backoff.delay_for(2), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay_for(3), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay_for(4), None);
    }

    #[test]
    fn caps_at_max_interval() {
        let backoff = Backoff {
            max_attempts: 20,
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay_for(10), Some(Duration::from_secs(15)));
    }

    #[test]
    fn jitter_stays_near_base() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let delay = backoff.delay_for(2).unwrap();
            let base = 1.0;
            assert!(delay.as_secs_f64() >= base * 0.8 - f64::EPSILON);
            assert!(delay.as_secs_f64() <= base * 1.2 + f64::EPSILON);
        }
    }
}
