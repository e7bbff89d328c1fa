use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::clock::Clock;
use crate::counter::{CounterSnapshot, CounterSource, FetchError};
use crate::filter::{FilterParams, RateValueFilter};
use crate::zscore::DetectorError;

const MODULUS_32: i128 = 1 << 32;
const MODULUS_64: i128 = 1 << 64;

/// Bytes per second in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficRate {
    pub in_bytes_per_sec: u64,
    pub out_bytes_per_sec: u64,
}

/// Bytes counted between two readings, corrected for one counter wrap.
/// `None` when the counter went backwards further than a wrap explains.
pub fn counter_delta(previous: u64, current: u64, is_64bit: bool) -> Option<u64> {
    let delta = i128::from(current) - i128::from(previous);
    if delta >= 0 {
        return u64::try_from(delta).ok();
    }
    let modulus = if is_64bit { MODULUS_64 } else { MODULUS_32 };
    u64::try_from(delta + modulus).ok()
}

/// Turns successive counter snapshots into filtered traffic rates.
///
/// Only the poll loop touches this, so it carries no locking of its own.
pub struct RateCalculator<S> {
    source: S,
    clock: Arc<dyn Clock>,
    previous: Option<CounterSnapshot>,
    // time represented by polls since `previous` was taken
    pending: Duration,
    download: RateValueFilter,
    upload: RateValueFilter,
}

impl<S: CounterSource> RateCalculator<S> {
    pub fn new(source: S, filter: FilterParams, clock: Arc<dyn Clock>) -> Result<Self, DetectorError> {
        Ok(Self {
            source,
            clock,
            previous: None,
            pending: Duration::ZERO,
            download: RateValueFilter::new(filter)?,
            upload: RateValueFilter::new(filter)?,
        })
    }

    #[cfg(test)]
    pub fn previous(&self) -> Option<CounterSnapshot> {
        self.previous
    }

    /// Raw per-direction rates run through the spike filters. `None` when no
    /// rate can be derived from the pair.
    pub fn compute_rate(
        &mut self,
        previous: &CounterSnapshot,
        current: &CounterSnapshot,
        elapsed: Duration,
    ) -> Option<TrafficRate> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let in_delta = counter_delta(previous.in_bytes, current.in_bytes, current.is_64bit)?;
        let out_delta = counter_delta(previous.out_bytes, current.out_bytes, current.is_64bit)?;

        let in_rate = self.download.filter_value(in_delta as f64 / secs);
        let out_rate = self.upload.filter_value(out_delta as f64 / secs);
        // truncates toward zero; negative and NaN saturate to 0
        Some(TrafficRate {
            in_bytes_per_sec: in_rate as u64,
            out_bytes_per_sec: out_rate as u64,
        })
    }

    /// One poll cycle. `since_last_poll` is the wall time the scheduler says
    /// this poll represents.
    pub fn poll(
        &mut self,
        since_last_poll: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<TrafficRate>, FetchError> {
        let elapsed = self.pending + since_last_poll;
        let started = self.clock.now();
        let fetched = self.source.fetch(cancel);
        let query_duration = self.clock.now().saturating_duration_since(started);

        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let current = match fetched {
            Ok(snapshot) => snapshot,
            Err(e @ FetchError::Cancelled(_)) => return Err(e),
            Err(e) => {
                // keep the last good snapshot; the gap is covered by `pending`
                if self.previous.is_some() {
                    self.pending = elapsed;
                }
                return Err(e);
            }
        };

        trace!(
            in_bytes = current.in_bytes,
            out_bytes = current.out_bytes,
            ?query_duration,
            "Traffic counters"
        );

        let Some(previous) = self.previous.replace(current) else {
            self.pending = Duration::ZERO;
            return Ok(None);
        };
        self.pending = Duration::ZERO;

        let rate = self.compute_rate(&previous, &current, elapsed);
        match rate {
            Some(rate) => debug!(
                in_bytes_per_sec = rate.in_bytes_per_sec,
                out_bytes_per_sec = rate.out_bytes_per_sec,
                ?query_duration,
                secs_since_last_update = elapsed.as_secs_f64(),
                "Traffic rate"
            ),
            None => warn!(
                ?previous,
                ?current,
                "No rate derivable from counter pair; rebasing on current reading"
            ),
        }
        Ok(rate)
    }
}
