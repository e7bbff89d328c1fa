use std::time::Duration;

use thiserror::Error;

use crate::filter::FilterParams;
use crate::zscore::DetectorError;

/// Fixed timeout the counter fetch and loop shutdown are held to.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("poll interval must be greater than zero")]
    NonPositiveInterval,
    #[error("counter fetch timeout must be greater than zero")]
    NonPositiveTimeout,
    #[error("poll interval of {0} seconds is out of range")]
    IntervalOutOfRange(f64),
    #[error("counter fetch timeout of {0} seconds is out of range")]
    TimeoutOutOfRange(f64),
    #[error("invalid spike filter parameters")]
    Filter(#[from] DetectorError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceConfig {
    pub poll_interval: Duration,
    pub filter: FilterParams,
    /// Upper bound on how long `dispose` waits for the poll loop to exit.
    pub join_timeout: Duration,
}

impl ServiceConfig {
    /// Config with filter parameters derived from the interval.
    pub fn new(poll_interval: Duration) -> Result<Self, ConfigError> {
        let config = Self {
            poll_interval,
            filter: FilterParams::for_poll_interval(poll_interval),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_filter(mut self, filter: FilterParams) -> Result<Self, ConfigError> {
        self.filter = filter;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval);
        }
        // surfaces bad lag/threshold/influence before anything is spawned
        crate::zscore::SpikeDetector::new(self.filter.lag, self.filter.threshold, self.filter.influence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(ServiceConfig::new(Duration::ZERO), Err(ConfigError::NonPositiveInterval)));
    }

    #[test]
    fn filter_defaults_follow_interval() {
        let config = ServiceConfig::new(Duration::from_secs(1)).unwrap();
        assert_eq!(config.filter, FilterParams::for_poll_interval(Duration::from_secs(1)));
        assert_eq!(config.join_timeout, DEFAULT_JOIN_TIMEOUT);
    }

    #[test]
    fn bad_filter_override_is_rejected() {
        let config = ServiceConfig::new(Duration::from_secs(1)).unwrap();
        let bad = FilterParams { lag: 3, threshold: 2.0, influence: 2.0 };
        assert!(matches!(config.with_filter(bad), Err(ConfigError::Filter(DetectorError::Influence(_)))));
    }
}
