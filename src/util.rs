//! Polling waits used by tests while the reactor thread does the I/O.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::{Error, Result};

/// How a wait ended. Timeouts are a value, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
    Aborted,
}

impl WaitOutcome {
    pub fn is_satisfied(self) -> bool {
        self == WaitOutcome::Satisfied
    }

    /// Turns anything but `Satisfied` into an assertion error.
    pub fn strict(self, what: &str) -> Result<()> {
        match self {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::TimedOut => Err(Error::assertion(format!("Timeout exceeded while waiting {}", what))),
            WaitOutcome::Aborted => Err(Error::assertion(format!("Aborted while waiting {}", what))),
        }
    }
}

/// Polls `cond` every `poll` until it holds, `abort` holds, or `timeout`
/// elapses. `cond` is checked once more after the deadline so a condition
/// that became true during the last sleep still counts.
pub async fn wait_until<C, A>(mut cond: C, timeout: Duration, poll: Duration, mut abort: A) -> WaitOutcome
where
    C: FnMut() -> bool,
    A: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return WaitOutcome::Satisfied;
        }
        if abort() {
            return WaitOutcome::Aborted;
        }
        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Locks `mutex`, carrying on with the data if a panicking thread
/// poisoned it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
