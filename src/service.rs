use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel as channel;
use tracing::warn;

use crate::clock::Clock;
use crate::config::{ConfigError, ServiceConfig};
use crate::counter::{CounterSource, FetchError};
use crate::rate::{RateCalculator, TrafficRate};
#[cfg(test)]
use crate::scheduler::Lifecycle;
use crate::scheduler::{PollScheduler, SchedulerError};
use crate::state::Subscribers;

/// Polls a counter source on a background loop and publishes one
/// `TrafficRate` per successful, non-first poll to every subscriber.
pub struct TrafficRateService<S> {
    scheduler: PollScheduler,
    // shared with the poll loop, which is its only user once started
    calculator: Arc<Mutex<RateCalculator<S>>>,
    subscribers: Arc<Subscribers>,
}

impl<S: CounterSource + 'static> TrafficRateService<S> {
    pub fn new(source: S, config: ServiceConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let scheduler = PollScheduler::new(config.poll_interval, config.join_timeout, Arc::clone(&clock))?;
        let calculator = RateCalculator::new(source, config.filter, clock)?;
        Ok(Self {
            scheduler,
            calculator: Arc::new(Mutex::new(calculator)),
            subscribers: Arc::new(Subscribers::new()),
        })
    }

    /// Receives every rate update emitted after this call.
    pub fn subscribe(&self) -> channel::Receiver<TrafficRate> {
        self.subscribers.subscribe()
    }

    #[cfg(test)]
    pub fn lifecycle(&self) -> Lifecycle {
        self.scheduler.lifecycle()
    }

    /// Starts the poll loop. A failed start leaves the service startable.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let calculator = Arc::clone(&self.calculator);
        let subscribers = Arc::clone(&self.subscribers);
        self.scheduler.start(move |since_last_poll, cancel| {
            let mut calculator = calculator.lock().unwrap_or_else(PoisonError::into_inner);
            match calculator.poll(since_last_poll, cancel) {
                Ok(Some(rate)) => subscribers.broadcast(rate),
                Ok(None) => {}
                Err(e @ FetchError::Cancelled(_)) => return Err(e.into()),
                Err(e) => {
                    // transient; the next successful poll spans the gap
                    warn!(error = %e, "Counter fetch failed; skipping cycle");
                }
            }
            Ok(())
        })
    }

    /// Stops the poll loop and disconnects all subscribers. Idempotent.
    pub fn dispose(&self) {
        self.scheduler.dispose();
        self.subscribers.dispose();
    }
}

impl<S> Drop for TrafficRateService<S> {
    fn drop(&mut self) {
        self.scheduler.dispose();
        self.subscribers.dispose();
    }
}
