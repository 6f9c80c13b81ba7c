use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Every timed suspension of the pipeline goes through a pacer.
pub trait Pacer: Send + Sync {
    /// Waits for `duration`. Returns `false` if `cancel` fired first.
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Sleeps on the calling thread in short slices so cancellation is prompt.
#[derive(Debug, Clone)]
pub struct ThreadPacer {
    slice: Duration,
}

impl Default for ThreadPacer {
    fn default() -> Self {
        Self {
            slice: Duration::from_millis(100),
        }
    }
}

impl Pacer for ThreadPacer {
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(self.slice.min(deadline - now));
        }
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingPacer;

#[cfg(test)]
mod recording {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::{CancelToken, Pacer};

    /// Records requested waits and returns immediately.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingPacer {
        waits: Mutex<Vec<Duration>>,
    }

    impl RecordingPacer {
        pub(crate) fn waits(&self) -> Vec<Duration> {
            self.waits.lock().map(|rows| rows.clone()).unwrap_or_default()
        }
    }

    impl Pacer for RecordingPacer {
        fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
            if let Ok(mut rows) = self.waits.lock() {
                rows.push(duration);
            }
            !cancel.is_cancelled()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CancelToken, Pacer, ThreadPacer};

    #[test]
    fn cancelled_wait_returns_early() {
        let cancel = CancelToken::new();
        cancel.clone().cancel();
        let started = Instant::now();
        assert!(!ThreadPacer::default().wait(Duration::from_secs(30), &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn short_wait_completes() {
        let cancel = CancelToken::new();
        assert!(ThreadPacer::default().wait(Duration::from_millis(5), &cancel));
    }
}
