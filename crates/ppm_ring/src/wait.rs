use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How the consumer waits while the producer has nothing for it.
///
/// The driver offers no wake-up notification cheaper than polling, so every
/// wait in the capture path is a fixed-interval pause routed through here.
pub trait WaitStrategy {
    fn wait(&mut self, period: Duration);
}

/// Sleeps the calling thread for the requested period
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepWait;

impl WaitStrategy for SleepWait {
    fn wait(&mut self, period: Duration) {
        thread::sleep(period);
    }
}

impl<F: FnMut(Duration)> WaitStrategy for F {
    fn wait(&mut self, period: Duration) {
        self(period)
    }
}

/// Counts waits instead of sleeping
///
/// Clones share the same counter, so a clone kept by a test observes the
/// waits performed by the copy handed to a reader.
#[derive(Debug, Default, Clone)]
pub struct RecordingWait {
    waits: Arc<AtomicUsize>,
}

impl RecordingWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of waits performed so far
    pub fn count(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }
}

impl WaitStrategy for RecordingWait {
    fn wait(&mut self, _period: Duration) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }
}
