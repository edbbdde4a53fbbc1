use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cooperative stop signal for background loops (the follower stream, the
/// interpreter-pool pruner). Waiters block on a Condvar so `stop()` wakes
/// them immediately instead of letting a sleep interval run out.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request shutdown and wake every waiter.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `stop()`. Returns true
    /// when shutdown was requested and the caller should exit its loop.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_stopped()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        assert!(!ShutdownSignal::new().is_stopped());
    }

    #[test]
    fn test_sleep_returns_immediately_after_stop() {
        let sig = ShutdownSignal::new();
        sig.stop();
        let start = std::time::Instant::now();
        assert!(sig.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_stop_wakes_sleeper() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            (sig2.sleep(Duration::from_secs(10)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.stop();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_expires_without_stop() {
        let sig = ShutdownSignal::new();
        assert!(!sig.sleep(Duration::from_millis(20)));
    }
}
