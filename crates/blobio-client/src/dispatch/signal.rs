//! De-duplicating wake signal for an idle worker

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A binary wake-up flag.
///
/// Posting while a wake-up is already pending is a no-op, so a burst of
/// pushes onto an idle worker costs one notification, not one per push.
#[derive(Default)]
pub struct WakeSignal {
    pending: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; returns false when one was already pending
    pub fn post(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _guard = self.lock.lock();
        self.cond.notify_one();
        true
    }

    /// Wake every waiter regardless of the pending flag
    pub fn wake_all(&self) {
        self.pending.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until posted or `timeout` elapses, consuming the signal.
    ///
    /// Returns whether a signal was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            return true;
        }
        let mut guard = self.lock.lock();
        if !self.pending.load(Ordering::Acquire) {
            let _ = self.cond.wait_for(&mut guard, timeout);
        }
        drop(guard);
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_deduplicates() {
        let signal = WakeSignal::new();
        assert!(signal.post());
        assert!(!signal.post());
        assert!(!signal.post());
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(!signal.is_pending());
        assert!(!signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_times_out() {
        let signal = WakeSignal::new();
        assert!(!signal.wait(Duration::from_millis(20)));
        assert!(!signal.is_pending());
    }

    #[test]
    fn test_post_wakes_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.post();
        assert!(waiter.join().unwrap());
    }
}
