use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cancel::{is_cancellation, CancelSource, CancelToken};
use crate::clock::Clock;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("poll loop is already running")]
    AlreadyStarted,
    #[error("poll scheduler has been disposed")]
    Disposed,
    #[error("spawning poll loop thread")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Disposed,
}

/// Delay before the next poll and how many nominal intervals that poll
/// will represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NextPoll {
    pub delay: Duration,
    pub cycles: u32,
}

/// Keeps the long-run poll cadence on `interval`: a poll that overruns skips
/// whole intervals, and the next poll is told how many it spans.
pub(crate) fn compensate(interval: Duration, spent: Duration) -> NextPoll {
    let step = interval.as_nanos() as i128;
    let mut remaining = step - spent.as_nanos() as i128;
    let mut cycles: u32 = 1;
    if remaining <= 0 && step > 0 {
        let skipped = -remaining / step + 1;
        remaining += skipped * step;
        cycles = u32::try_from(skipped + 1).unwrap_or(u32::MAX);
    }
    NextPoll {
        delay: Duration::from_nanos(u64::try_from(remaining.max(0)).unwrap_or(u64::MAX)),
        cycles,
    }
}

struct LoopHandle {
    cancel: CancelSource,
    // disconnects when the loop thread exits, even by panic
    done: channel::Receiver<()>,
    thread: thread::JoinHandle<()>,
}

enum State {
    NotStarted,
    Running(LoopHandle),
    Disposed,
}

/// Drives a poll step on a background thread at a nominal interval,
/// compensating for slow polls.
pub struct PollScheduler {
    interval: Duration,
    join_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    #[cfg(test)]
    pub(crate) refuse_spawn: std::sync::atomic::AtomicBool,
}

impl PollScheduler {
    pub fn new(interval: Duration, join_timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval);
        }
        Ok(Self {
            interval,
            join_timeout,
            clock,
            state: Mutex::new(State::NotStarted),
            #[cfg(test)]
            refuse_spawn: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match *self.lock_state() {
            State::NotStarted => Lifecycle::NotStarted,
            State::Running(_) => Lifecycle::Running,
            State::Disposed => Lifecycle::Disposed,
        }
    }

    /// Spawns the poll loop. `step` receives the wall time the poll
    /// represents and must return promptly once the token is cancelled.
    pub fn start<F>(&self, step: F) -> Result<(), SchedulerError>
    where
        F: FnMut(Duration, &CancelToken) -> anyhow::Result<()> + Send + 'static,
    {
        let mut state = self.lock_state();
        match *state {
            State::NotStarted => {}
            State::Running(_) => return Err(SchedulerError::AlreadyStarted),
            State::Disposed => return Err(SchedulerError::Disposed),
        }

        #[cfg(test)]
        if self.refuse_spawn.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(SchedulerError::Spawn(io::Error::new(io::ErrorKind::Other, "thread limit reached")));
        }

        let cancel = CancelSource::new();
        let token = cancel.token();
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let interval = self.interval;
        let clock = Arc::clone(&self.clock);
        let thread = thread::Builder::new()
            .name("poll-loop".into())
            .spawn(move || {
                let _done = done_tx;
                run_loop(interval, clock.as_ref(), &token, step);
            })
            .map_err(SchedulerError::Spawn)?;

        info!(interval = ?self.interval, "Poll loop started");
        *state = State::Running(LoopHandle {
            cancel,
            done: done_rx,
            thread,
        });
        Ok(())
    }

    /// Cancels the loop and waits up to the join timeout for it to exit.
    /// Safe to call from any thread, any number of times.
    pub fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), State::Disposed);
        let State::Running(handle) = previous else {
            return;
        };

        handle.cancel.cancel();
        if handle.thread.thread().id() == thread::current().id() {
            debug!("Dispose requested from the poll loop; not joining");
            return;
        }

        match handle.done.recv_timeout(self.join_timeout) {
            Err(channel::RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.join_timeout, "Poll loop did not stop in time; detaching");
            }
            Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    warn!("Poll loop thread panicked");
                }
                info!("Poll loop stopped");
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_loop<F>(interval: Duration, clock: &dyn Clock, cancel: &CancelToken, mut step: F)
where
    F: FnMut(Duration, &CancelToken) -> anyhow::Result<()>,
{
    let mut cycles: u32 = 1;
    while !cancel.is_cancelled() {
        let started = clock.now();
        let since_last_poll = interval.saturating_mul(cycles);

        match panic::catch_unwind(AssertUnwindSafe(|| step(since_last_poll, cancel))) {
            Ok(Ok(())) => {}
            Ok(Err(_)) if cancel.is_cancelled() => break,
            Ok(Err(e)) if is_cancellation(&e) => break,
            Ok(Err(e)) => error!(error = ?e, "Unhandled error in poll loop"),
            Err(_) => error!("Poll step panicked"),
        }

        let spent = clock.now().saturating_duration_since(started);
        let next = compensate(interval, spent);
        if next.cycles > 1 {
            debug!(?spent, cycles = next.cycles, "Poll overran its interval");
        }
        cycles = next.cycles;

        if clock.sleep(next.delay, cancel).is_err() {
            break;
        }
    }
    debug!("Poll loop exiting");
}


#[cfg(test)]
mod itests {
    use super::*;
    use crate::cancel::Cancelled;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const SEC: Duration = Duration::from_secs(1);
    const WAIT: Duration = Duration::from_secs(5);

    /// Runs three polls on a virtual clock; the first advances time by
    /// `first_poll_takes`. Returns what each poll was told and the sleeps.
    fn run_virtual(first_poll_takes: Duration) -> (Vec<Duration>, Vec<Duration>) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = PollScheduler::new(SEC, WAIT, clock.clone()).unwrap();
        let (tx, rx) = channel::unbounded::<Duration>();
        let clock_for_step = Arc::clone(&clock);
        let mut polls = 0;
        scheduler
            .start(move |since_last, _cancel| {
                polls += 1;
                let _ = tx.send(since_last);
                match polls {
                    1 => clock_for_step.advance(first_poll_takes),
                    2 => {}
                    _ => return Err(Cancelled.into()),
                }
                Ok(())
            })
            .unwrap();

        let told: Vec<Duration> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        scheduler.dispose();
        (told, clock.sleeps())
    }

    #[test]
    fn loop_compensates_when_poll_is_faster_than_interval() {
        let (told, sleeps) = run_virtual(Duration::from_millis(300));
        assert_eq!(told, vec![SEC, SEC, SEC]);
        assert_eq!(sleeps, vec![Duration::from_millis(700), SEC]);
    }

    #[test]
    fn loop_compensates_when_poll_overruns_interval() {
        let (told, sleeps) = run_virtual(Duration::from_secs(3));
        assert_eq!(told, vec![SEC, Duration::from_secs(4), SEC]);
        assert_eq!(sleeps, vec![SEC, SEC]);
    }

    #[test]
    fn failing_poll_is_followed_by_another_after_normal_delay() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = PollScheduler::new(SEC, WAIT, clock.clone()).unwrap();
        let (tx, rx) = channel::unbounded::<Duration>();
        let mut polls = 0;
        scheduler
            .start(move |since_last, _cancel| {
                polls += 1;
                let _ = tx.send(since_last);
                match polls {
                    1 => Err(anyhow::anyhow!("agent unreachable")),
                    2 => panic!("bad cycle"),
                    3 => Ok(()),
                    _ => Err(Cancelled.into()),
                }
            })
            .unwrap();

        let told: Vec<Duration> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(told, vec![SEC; 4]);
        scheduler.dispose();
        assert_eq!(clock.sleeps(), vec![SEC; 3]);
    }

    #[test]
    fn start_twice_is_rejected_and_first_loop_keeps_running() {
        let scheduler = PollScheduler::new(Duration::from_millis(5), WAIT, Arc::new(SystemClock)).unwrap();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        scheduler
            .start(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(scheduler.lifecycle(), Lifecycle::Running);
        assert!(matches!(scheduler.start(|_, _| Ok(())), Err(SchedulerError::AlreadyStarted)));

        let deadline = Instant::now() + WAIT;
        while polls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(polls.load(Ordering::SeqCst) >= 3);
        scheduler.dispose();
        assert_eq!(scheduler.lifecycle(), Lifecycle::Disposed);
    }

    #[test]
    fn dispose_interrupts_long_sleep_and_is_idempotent() {
        let scheduler = PollScheduler::new(Duration::from_secs(3600), WAIT, Arc::new(SystemClock)).unwrap();
        let (tx, rx) = channel::unbounded::<()>();
        scheduler
            .start(move |_, _| {
                let _ = tx.send(());
                Ok(())
            })
            .unwrap();
        rx.recv_timeout(WAIT).unwrap();

        let started = Instant::now();
        scheduler.dispose();
        scheduler.dispose();
        assert!(started.elapsed() < WAIT);
        assert!(matches!(scheduler.start(|_, _| Ok(())), Err(SchedulerError::Disposed)));
    }

    #[test]
    fn dispose_before_start_is_a_no_op() {
        let scheduler = PollScheduler::new(SEC, WAIT, Arc::new(SystemClock)).unwrap();
        assert_eq!(scheduler.lifecycle(), Lifecycle::NotStarted);
        scheduler.dispose();
        scheduler.dispose();
        assert_eq!(scheduler.lifecycle(), Lifecycle::Disposed);
    }

    #[test]
    fn dispose_gives_up_on_a_stuck_loop_after_timeout() {
        let timeout = Duration::from_millis(50);
        let scheduler = PollScheduler::new(SEC, timeout, Arc::new(SystemClock)).unwrap();
        let (entered_tx, entered_rx) = channel::unbounded::<()>();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        scheduler
            .start(move |_, _| {
                let _ = entered_tx.send(());
                // ignores cancellation until released
                let _ = release_rx.recv_timeout(WAIT);
                Ok(())
            })
            .unwrap();
        entered_rx.recv_timeout(WAIT).unwrap();

        let started = Instant::now();
        scheduler.dispose();
        assert!(started.elapsed() < WAIT);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn dispose_from_inside_the_loop_does_not_deadlock() {
        let scheduler = Arc::new(PollScheduler::new(Duration::from_millis(5), WAIT, Arc::new(SystemClock)).unwrap());
        let (tx, rx) = channel::unbounded::<Lifecycle>();
        let inner = Arc::clone(&scheduler);
        scheduler
            .start(move |_, _| {
                inner.dispose();
                let _ = tx.send(inner.lifecycle());
                Ok(())
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Lifecycle::Disposed);
        // the loop saw cancellation and exited; no second poll
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
