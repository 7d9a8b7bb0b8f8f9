//! Shutdown coordination latch
//!
//! The topology monitor acquires the latch before any network call within a
//! tick; the hold is released when the returned guard drops, covering every
//! exit path. Shutdown closes the latch (new acquisitions fail) and waits
//! for outstanding holders to drain.

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct LatchState {
    closed: bool,
    active: usize,
}

/// Counting latch that refuses new work once closed.
#[derive(Default)]
pub struct ShutdownLatch {
    state: Mutex<LatchState>,
    drained: Notify,
}

/// Hold on the latch; releases on drop.
pub struct LatchGuard<'a> {
    latch: &'a ShutdownLatch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.release();
    }
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a hold on the latch. Fails once shutdown has begun.
    pub fn acquire(&self) -> Option<LatchGuard<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.active += 1;
        Some(LatchGuard { latch: self })
    }

    fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.active > 0);
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            drop(state);
            self.drained.notify_waiters();
        }
    }

    /// Close the latch and wait until all outstanding holds are released.
    pub async fn close_and_wait(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            if state.active == 0 {
                return;
            }
        }

        loop {
            let notified = self.drained.notified();
            if self.state.lock().active == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
