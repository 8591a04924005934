//! Adjustable Admission Semaphore
//!
//! Bounds the number of live items in the queue. A permit is taken at
//! submit time and held until the item reaches a terminal verdict, so the
//! ceiling covers items in flight, in the transfer channel, in the spill
//! store, and in the retry delay set combined. Unlike a plain semaphore
//! the maximum can be resized at runtime: growing takes effect
//! immediately, shrinking lets already-acquired permits drain naturally
//! instead of cancelling them.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;

/// Outcome of a timed permit acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    Acquired,
    TimedOut,
    Closed,
}

struct SemState {
    /// Configured ceiling.
    max: usize,
    /// Permits currently held by live items.
    held: usize,
    /// Releases to swallow after a shrink, so the ceiling converges
    /// without revoking permits already handed out.
    deficit: usize,
}

pub(crate) struct AdjustableSemaphore {
    permits: Arc<Semaphore>,
    state: Mutex<SemState>,
}

impl AdjustableSemaphore {
    pub fn new(max: usize) -> Self {
        let max = max.min(Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(max)),
            state: Mutex::new(SemState {
                max,
                held: 0,
                deficit: 0,
            }),
        }
    }

    /// Take one permit without waiting. Returns false when none are
    /// available or the semaphore is closed.
    pub fn try_acquire(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.state.lock().unwrap().held += 1;
                true
            }
            Err(_) => false,
        }
    }

    /// Wait up to `timeout` for a permit.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Acquire {
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.state.lock().unwrap().held += 1;
                Acquire::Acquired
            }
            Ok(Err(_)) => Acquire::Closed,
            Err(_) => Acquire::TimedOut,
        }
    }

    /// Take up to `want` permits without waiting; returns how many were
    /// actually acquired. Used at startup to account for entries already
    /// on disk.
    pub fn acquire_many_now(&self, want: usize) -> usize {
        let mut taken = 0;
        while taken < want && self.try_acquire() {
            taken += 1;
        }
        taken
    }

    /// Return one permit. Never pushes the available count past the
    /// configured maximum; releases without a matching acquire are
    /// ignored.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if state.held == 0 {
            return;
        }
        state.held -= 1;
        if state.deficit > 0 {
            state.deficit -= 1;
        } else {
            self.permits.add_permits(1);
        }
    }

    /// Resize the ceiling. Growing adds permits immediately; shrinking
    /// removes idle permits now and records the remainder as a deficit
    /// absorbed by future releases.
    pub fn set_max(&self, new_max: usize) {
        let new_max = new_max.min(Semaphore::MAX_PERMITS);
        let mut state = self.state.lock().unwrap();
        if new_max >= state.max {
            let mut grow = new_max - state.max;
            let cancelled = state.deficit.min(grow);
            state.deficit -= cancelled;
            grow -= cancelled;
            if grow > 0 {
                self.permits.add_permits(grow);
            }
        } else {
            let mut shrink = state.max - new_max;
            while shrink > 0 {
                match self.permits.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            state.deficit += shrink;
        }
        state.max = new_max;
    }

    /// Close the semaphore, waking every blocked acquirer.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max(&self) -> usize {
        self.state.lock().unwrap().max
    }
}
