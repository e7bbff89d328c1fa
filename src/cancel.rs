use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel as channel;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// True if any error in the chain is a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

/// Owning side of a cancellation signal.
///
/// Waiters block on a channel that never carries a message; cancelling drops
/// the only sender, which wakes every blocked `recv` at once.
pub struct CancelSource {
    flag: Arc<AtomicBool>,
    wake_tx: Mutex<Option<channel::Sender<()>>>,
    token: CancelToken,
}

#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    wake_rx: channel::Receiver<()>,
}

impl CancelSource {
    pub fn new() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = channel::bounded::<()>(0);
        Self {
            token: CancelToken {
                flag: flag.clone(),
                wake_rx,
            },
            flag,
            wake_tx: Mutex::new(Some(wake_tx)),
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `timeout` unless cancelled first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), Cancelled> {
        self.check()?;
        match self.wake_rx.recv_timeout(timeout) {
            Err(channel::RecvTimeoutError::Timeout) => Ok(()),
            Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => Err(Cancelled),
        }
    }

    /// Channel that disconnects on cancellation, for use in `select!`.
    pub(crate) fn wake_channel(&self) -> &channel::Receiver<()> {
        &self.wake_rx
    }

    /// Blocks until cancelled.
    #[cfg(test)]
    pub fn wait(&self) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.wake_rx.recv();
    }
}
