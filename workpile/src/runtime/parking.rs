use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One per worker. An unpark that lands before the park is absorbed by the
/// notified flag. The wait is bounded: a push can still slip into the window
/// between a failed queue scan and the sleep, and the timeout caps what that
/// race can cost.
pub(crate) struct Parker {
    notified: AtomicBool,
    parked: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn park(&self, timeout: Duration) {
        if self.notified.swap(false, Ordering::Acquire) {
            return;
        }

        let mut guard = self.mutex.lock();

        // Re-check under the lock: unpark takes the same lock, so a wakeup
        // arriving here cannot be lost.
        if self.notified.swap(false, Ordering::Acquire) {
            return;
        }

        self.parked.store(true, Ordering::Release);
        let _ = self.condvar.wait_for(&mut guard, timeout);
        self.parked.store(false, Ordering::Release);
        self.notified.store(false, Ordering::Release);
    }

    pub(crate) fn unpark(&self) {
        self.notified.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_one();
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_unpark_before_park_is_absorbed() {
        let parker = Parker::new();
        parker.unpark();

        let start = Instant::now();
        parker.park(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_park_times_out() {
        let parker = Parker::new();

        let start = Instant::now();
        parker.park(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_cross_thread_unpark() {
        let parker = Arc::new(Parker::new());

        let remote = Arc::clone(&parker);
        let handle = std::thread::spawn(move || {
            while !remote.is_parked() {
                std::thread::yield_now();
            }
            remote.unpark();
        });

        let start = Instant::now();
        parker.park(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().expect("unpark thread panicked");
    }
}
