//! Trailing-window z-score peak detector.
//!
//! Each new sample is compared against the mean and sample standard
//! deviation of the previous `lag` samples. Samples further than
//! `threshold` deviations away are classified as peaks and damped toward
//! the previous window entry before being fed back into the window.

use thiserror::Error;

use crate::window::{SlidingWindow, WindowError};

#[derive(Debug, Error, PartialEq)]
pub enum DetectorError {
    #[error("invalid lag: {0}")]
    Lag(#[from] WindowError),
    #[error("threshold must be a positive number of standard deviations, got {0}")]
    Threshold(f64),
    #[error("influence must be within [0, 1], got {0}")]
    Influence(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakType {
    BelowAverage,
    None,
    AboveAverage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub peak: PeakType,
    pub adjusted: f64,
}

#[derive(Debug, Clone)]
pub struct SpikeDetector {
    window: SlidingWindow<f64>,
    threshold: f64,
    influence: f64,
}

impl SpikeDetector {
    pub fn new(lag: usize, threshold: f64, influence: f64) -> Result<Self, DetectorError> {
        let window = SlidingWindow::new(lag)?;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(DetectorError::Threshold(threshold));
        }
        if !(0.0..=1.0).contains(&influence) {
            return Err(DetectorError::Influence(influence));
        }
        Ok(Self {
            window,
            threshold,
            influence,
        })
    }

    pub fn add(&mut self, value: f64) -> Verdict {
        if !self.window.is_full() {
            self.window.push(value);
            return Verdict {
                peak: PeakType::None,
                adjusted: value,
            };
        }

        let mean = self.window.mean();
        let std_dev = self.window.sample_std_dev(mean);
        let mut verdict = Verdict {
            peak: PeakType::None,
            adjusted: value,
        };

        // A constant window has zero deviation, so any change registers. A
        // single-sample window has no deviation at all and never flags.
        if (value - mean).abs() > self.threshold * std_dev {
            verdict.peak = if value > mean {
                PeakType::AboveAverage
            } else {
                PeakType::BelowAverage
            };
            let last = self.window.back().unwrap_or(value);
            verdict.adjusted = self.influence * value + (1.0 - self.influence) * last;
        }

        self.window.push(verdict.adjusted);
        verdict
    }
}
