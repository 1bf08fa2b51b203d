use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Default ring capacity used by the driver
pub const RING_BUF_SIZE: u32 = 1024 * 1024;

/// Minimum backlog a blocking refill waits for
pub const MIN_USERSPACE_READ_SIZE: u32 = 128 * 1024;

/// Polling interval used while waiting for the producer
pub const BUFFER_EMPTY_WAIT_TIME: Duration = Duration::from_millis(30);

/// Shared control block of a device ring
///
/// `head` and the counters belong to the producer. `tail` belongs to the
/// consumer and is only ever published through [`RingControlBlock::publish_tail`].
#[repr(C)]
#[derive(Debug, Default)]
pub struct RingControlBlock {
    head: AtomicU32,
    tail: AtomicU32,
    n_evts: AtomicU64,
    n_drops_buffer: AtomicU64,
    n_drops_pf: AtomicU64,
    n_preemptions: AtomicU64,
    n_context_switches: AtomicU64,
}

/// Snapshot of the producer counters of one ring
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingCounters {
    pub n_evts: u64,
    pub n_drops_buffer: u64,
    pub n_drops_pf: u64,
    pub n_preemptions: u64,
    pub n_context_switches: u64,
}

impl RingControlBlock {
    /// Creates a zeroed control block
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer write position
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Consumer read position
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Publishes a new consumer position. Callers must fence before this.
    pub(crate) fn publish_tail(&self, tail: u32) {
        self.tail.store(tail, Ordering::Release);
    }

    /// Reads the cumulative producer counters
    pub fn counters(&self) -> RingCounters {
        RingCounters {
            n_evts: self.n_evts.load(Ordering::Relaxed),
            n_drops_buffer: self.n_drops_buffer.load(Ordering::Relaxed),
            n_drops_pf: self.n_drops_pf.load(Ordering::Relaxed),
            n_preemptions: self.n_preemptions.load(Ordering::Relaxed),
            n_context_switches: self.n_context_switches.load(Ordering::Relaxed),
        }
    }

    // Producer side, only used by in-process storages that stand in for the driver.

    pub(crate) fn produce_head(&self, head: u32) {
        self.head.store(head, Ordering::Release);
    }

    pub(crate) fn force_tail(&self, tail: u32) {
        self.tail.store(tail, Ordering::Release);
    }

    pub(crate) fn store_counters(&self, counters: RingCounters) {
        self.n_evts.store(counters.n_evts, Ordering::Relaxed);
        self.n_drops_buffer
            .store(counters.n_drops_buffer, Ordering::Relaxed);
        self.n_drops_pf.store(counters.n_drops_pf, Ordering::Relaxed);
        self.n_preemptions
            .store(counters.n_preemptions, Ordering::Relaxed);
        self.n_context_switches
            .store(counters.n_context_switches, Ordering::Relaxed);
    }
}
