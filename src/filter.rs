use std::time::Duration;

use crate::zscore::{DetectorError, PeakType, SpikeDetector};

/// Spike-detector tuning for one traffic direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub lag: usize,
    pub threshold: f64,
    pub influence: f64,
}

impl FilterParams {
    /// Defaults tuned to catch the SNMP double-interval-read spike without
    /// discarding sustained rate changes. Shorter intervals get a longer lag.
    pub fn for_poll_interval(interval: Duration) -> Self {
        let secs = interval.as_secs().min(4) as usize;
        Self {
            lag: (4 - secs).max(2),
            threshold: 2.0,
            influence: 1.0,
        }
    }
}

/// Replaces one-off upward spikes with the last accepted rate. Decreases and
/// steady values pass through.
#[derive(Debug, Clone)]
pub struct RateValueFilter {
    detector: SpikeDetector,
    last_accepted: f64,
}

impl RateValueFilter {
    pub fn new(params: FilterParams) -> Result<Self, DetectorError> {
        Ok(Self {
            detector: SpikeDetector::new(params.lag, params.threshold, params.influence)?,
            last_accepted: 0.0,
        })
    }

    pub fn filter_value(&mut self, raw: f64) -> f64 {
        let verdict = self.detector.add(raw);
        match verdict.peak {
            PeakType::None | PeakType::BelowAverage => {
                self.last_accepted = verdict.adjusted;
                verdict.adjusted
            }
            PeakType::AboveAverage => self.last_accepted,
        }
    }
}
