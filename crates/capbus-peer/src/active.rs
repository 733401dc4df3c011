//! Shared "active" references gating peer teardown.
//!
//! Any access to a peer's state holds a shared active reference on that
//! peer. Teardown first marks the gate draining, which refuses new
//! acquisitions, then blocks until every outstanding holder releases. The
//! gate never un-drains.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct ActiveState {
    holders: u64,
    draining: bool,
}

/// Counter-gated liveness for one peer.
#[derive(Debug, Default)]
pub struct Active {
    state: Mutex<ActiveState>,
    drained: Condvar,
}

impl Active {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared reference. Fails once draining has begun.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.draining {
            return false;
        }
        state.holders += 1;
        true
    }

    /// Acquire another reference on behalf of an existing holder.
    ///
    /// Unlike [`try_acquire`](Self::try_acquire) this succeeds during a
    /// drain: the existing holder already blocks teardown.
    pub fn acquire_existing(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.holders > 0, "acquire_existing without a holder");
        state.holders += 1;
    }

    /// Release one shared reference.
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.holders > 0, "active reference underflow");
        state.holders -= 1;
        if state.draining && state.holders == 0 {
            self.drained.notify_all();
        }
    }

    /// Begin draining and block until every holder has released.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.draining = true;
        while state.holders > 0 {
            self.drained.wait(&mut state);
        }
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    #[must_use]
    pub fn holders(&self) -> u64 {
        self.state.lock().holders
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let active = Active::new();
        assert!(active.try_acquire());
        assert!(active.try_acquire());
        assert_eq!(active.holders(), 2);
        active.release();
        active.release();
        assert_eq!(active.holders(), 0);
    }

    #[test]
    fn drain_refuses_new_holders() {
        let active = Active::new();
        active.drain();
        assert!(active.is_draining());
        assert!(!active.try_acquire());
    }

    #[test]
    fn drain_blocks_until_holders_release() {
        let active = Arc::new(Active::new());
        assert!(active.try_acquire());

        let holder = Arc::clone(&active);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            holder.release();
        });

        active.drain();
        assert_eq!(active.holders(), 0);
        releaser.join().expect("releaser thread");
    }

    #[test]
    fn existing_holder_can_clone_during_drain() {
        let active = Arc::new(Active::new());
        assert!(active.try_acquire());

        let cloner = Arc::clone(&active);
        let worker = std::thread::spawn(move || {
            cloner.acquire_existing();
            std::thread::sleep(Duration::from_millis(20));
            cloner.release();
            cloner.release();
        });

        std::thread::sleep(Duration::from_millis(5));
        active.drain();
        worker.join().expect("worker thread");
        assert_eq!(active.holders(), 0);
    }
}
