//! Scheduler configuration

use std::time::Duration;

/// Tunables for the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the detection/timing tick fires
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Read overrides from the environment (`CONVOY_TICK_INTERVAL_SECS`)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var("CONVOY_TICK_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.tick_interval = Duration::from_secs(secs);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_is_five_minutes() {
        assert_eq!(SchedulerConfig::default().tick_interval, Duration::from_secs(300));
    }

    #[test]
    fn builder_overrides() {
        let config = SchedulerConfig::new().with_tick_interval(Duration::from_secs(30));
        assert_eq!(config.tick_interval, Duration::from_secs(30));
    }
}
