use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, Cancelled};

/// Cumulative interface byte counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub in_bytes: u64,
    pub out_bytes: u64,
    /// Counters wrap at 2^64 rather than 2^32.
    pub is_64bit: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("counter source unavailable: {0}")]
    Unavailable(String),
    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),
    #[error("malformed counter data: {0}")]
    Parse(String),
    #[error("reading counters from {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("counter fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter fetch cancelled")]
    Cancelled(#[from] Cancelled),
}

/// Supplies cumulative byte counters on demand. SNMP agents, procfs and
/// other local counter providers all sit behind this.
pub trait CounterSource: Send {
    fn fetch(&mut self, cancel: &CancelToken) -> Result<CounterSnapshot, FetchError>;
}

impl<S: CounterSource + ?Sized> CounterSource for Box<S> {
    fn fetch(&mut self, cancel: &CancelToken) -> Result<CounterSnapshot, FetchError> {
        (**self).fetch(cancel)
    }
}

type FetchReply = (u64, Result<CounterSnapshot, FetchError>);

/// Runs another source on a worker thread and gives up on fetches that take
/// longer than `timeout`. A hung fetch keeps the worker busy; requests that
/// queue up behind it collapse to the newest one, and replies to abandoned
/// requests are discarded by sequence number.
pub struct TimeoutSource {
    requests: Option<channel::Sender<(u64, CancelToken)>>,
    replies: channel::Receiver<FetchReply>,
    timeout: Duration,
    seq: u64,
    worker: Option<thread::JoinHandle<()>>,
}

impl TimeoutSource {
    pub fn spawn<S>(mut inner: S, timeout: Duration) -> io::Result<Self>
    where
        S: CounterSource + 'static,
    {
        let (req_tx, req_rx) = channel::unbounded::<(u64, CancelToken)>();
        let (reply_tx, reply_rx) = channel::unbounded::<FetchReply>();
        let worker = thread::Builder::new()
            .name("counter-fetch".into())
            .spawn(move || {
                while let Ok((mut seq, mut cancel)) = req_rx.recv() {
                    // only the newest caller can still be waiting
                    let mut skipped = 0u64;
                    while let Ok((newer_seq, newer_cancel)) = req_rx.try_recv() {
                        seq = newer_seq;
                        cancel = newer_cancel;
                        skipped += 1;
                    }
                    if skipped > 0 {
                        debug!(skipped, seq, "Dropping abandoned counter requests");
                    }
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let result = inner.fetch(&cancel);
                    if reply_tx.send((seq, result)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            requests: Some(req_tx),
            replies: reply_rx,
            timeout,
            seq: 0,
            worker: Some(worker),
        })
    }
}

impl CounterSource for TimeoutSource {
    fn fetch(&mut self, cancel: &CancelToken) -> Result<CounterSnapshot, FetchError> {
        cancel.check()?;
        self.seq += 1;
        let seq = self.seq;
        let Some(requests) = &self.requests else {
            return Err(FetchError::Unavailable("fetch worker stopped".into()));
        };
        requests
            .send((seq, cancel.clone()))
            .map_err(|_| FetchError::Unavailable("fetch worker stopped".into()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            channel::select! {
                recv(self.replies) -> msg => match msg {
                    Ok((reply_seq, result)) if reply_seq == seq => return result,
                    Ok((stale, _)) => debug!(seq = stale, "Discarding late counter reply"),
                    Err(_) => return Err(FetchError::Unavailable("fetch worker stopped".into())),
                },
                recv(cancel.wake_channel()) -> _ => return Err(Cancelled.into()),
                default(remaining) => {
                    warn!(timeout = ?self.timeout, "Counter fetch timed out");
                    return Err(FetchError::Timeout(self.timeout));
                }
            }
        }
    }
}

impl Drop for TimeoutSource {
    fn drop(&mut self) {
        // closing the request queue ends the worker after its current fetch
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}

/// Scripted source for tests. Once the script runs out it parks until
/// cancelled.
#[cfg(test)]
pub struct SequenceSource {
    readings: std::collections::VecDeque<Result<CounterSnapshot, FetchError>>,
    pub fetches: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl SequenceSource {
    pub fn new(readings: Vec<Result<CounterSnapshot, FetchError>>) -> Self {
        Self {
            readings: readings.into(),
            fetches: Default::default(),
        }
    }

    pub fn snapshots(readings: &[(u64, u64)], is_64bit: bool) -> Self {
        Self::new(
            readings
                .iter()
                .map(|&(in_bytes, out_bytes)| Ok(CounterSnapshot { in_bytes, out_bytes, is_64bit }))
                .collect(),
        )
    }
}

#[cfg(test)]
impl CounterSource for SequenceSource {
    fn fetch(&mut self, cancel: &CancelToken) -> Result<CounterSnapshot, FetchError> {
        self.fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.readings.pop_front() {
            Some(reading) => reading,
            None => {
                cancel.wait();
                Err(Cancelled.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;

    struct SlowSource {
        delay: Duration,
        value: u64,
    }

    impl CounterSource for SlowSource {
        fn fetch(&mut self, _cancel: &CancelToken) -> Result<CounterSnapshot, FetchError> {
            thread::sleep(self.delay);
            self.value += 1;
            Ok(CounterSnapshot { in_bytes: self.value, out_bytes: self.value, is_64bit: true })
        }
    }

    #[test]
    fn sequence_source_replays_then_parks_until_cancelled() {
        let mut source = SequenceSource::snapshots(&[(1, 2)], false);
        let cancel = CancelSource::new();
        let first = source.fetch(&cancel.token()).unwrap();
        assert_eq!(first, CounterSnapshot { in_bytes: 1, out_bytes: 2, is_64bit: false });
        cancel.cancel();
        assert!(matches!(source.fetch(&cancel.token()), Err(FetchError::Cancelled(_))));
    }

    #[test]
    fn timeout_source_passes_through_fast_fetches() {
        let inner = SlowSource { delay: Duration::ZERO, value: 0 };
        let mut source = TimeoutSource::spawn(inner, Duration::from_secs(5)).unwrap();
        let cancel = CancelSource::new();
        assert_eq!(source.fetch(&cancel.token()).unwrap().in_bytes, 1);
        assert_eq!(source.fetch(&cancel.token()).unwrap().in_bytes, 2);
    }

    #[test]
    fn timeout_source_gives_up_and_discards_late_reply() {
        let inner = SlowSource { delay: Duration::from_millis(300), value: 0 };
        let mut source = TimeoutSource::spawn(inner, Duration::from_millis(50)).unwrap();
        let cancel = CancelSource::new();
        assert!(matches!(source.fetch(&cancel.token()), Err(FetchError::Timeout(_))));

        source.timeout = Duration::from_secs(5);
        // first reply (value 1) belongs to the abandoned request
        assert_eq!(source.fetch(&cancel.token()).unwrap().in_bytes, 2);
    }

    #[test]
    fn timeout_source_skips_backlog_after_slow_fetches() {
        let inner = SlowSource { delay: Duration::from_millis(200), value: 0 };
        let mut source = TimeoutSource::spawn(inner, Duration::from_millis(20)).unwrap();
        let cancel = CancelSource::new();
        for _ in 0..10 {
            assert!(matches!(source.fetch(&cancel.token()), Err(FetchError::Timeout(_))));
        }

        source.timeout = Duration::from_secs(10);
        let started = Instant::now();
        let snapshot = source.fetch(&cancel.token()).unwrap();
        // `value` counts inner fetches: the stuck one, at most one stale
        // request picked up while it ran, then this one
        assert!(snapshot.in_bytes <= 3, "inner fetches: {}", snapshot.in_bytes);
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    }

    #[test]
    fn timeout_source_observes_cancellation() {
        let inner = SlowSource { delay: Duration::from_millis(500), value: 0 };
        let mut source = TimeoutSource::spawn(inner, Duration::from_secs(30)).unwrap();
        let cancel = CancelSource::new();
        let token = cancel.token();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let started = Instant::now();
        assert!(matches!(source.fetch(&token), Err(FetchError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }
}
