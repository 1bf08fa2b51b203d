use std::io;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::{ControlRequest, RingControlBlock, RingCounters, RingStorage, StorageError};

struct SharedRing {
    control: RingControlBlock,
    // 2 * capacity bytes, the second half mirroring the first
    data: *mut u8,
    capacity: u32,
    requests: Mutex<Vec<ControlRequest>>,
    fail_requests: AtomicBool,
}

// Safety: the data region is only written through MemoryProducer, which plays
// the kernel's role and only writes outside the unread window.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl Drop for SharedRing {
    fn drop(&mut self) {
        let len = 2 * self.capacity as usize;
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.data, len)));
        }
    }
}

/// Memory-based ring storage implementation
///
/// Stands in for a driver device: useful for testing and for replaying
/// synthetic traffic through the live capture path. The producer side is
/// driven through [`MemoryProducer`].
pub struct MemoryRingStorage {
    shared: Arc<SharedRing>,
}

impl MemoryRingStorage {
    /// Create a new memory-based ring storage of `capacity` bytes
    pub fn new(capacity: u32) -> Result<Self, StorageError> {
        if capacity < 2 {
            return Err(StorageError::InvalidCapacity {
                capacity,
                page_size: 1,
            });
        }

        let data = vec![0u8; 2 * capacity as usize].into_boxed_slice();

        Ok(MemoryRingStorage {
            shared: Arc::new(SharedRing {
                control: RingControlBlock::new(),
                data: Box::into_raw(data) as *mut u8,
                capacity,
                requests: Mutex::new(Vec::new()),
                fail_requests: AtomicBool::new(false),
            }),
        })
    }

    /// Returns a handle acting as the kernel-side producer of this ring
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            shared: self.shared.clone(),
        }
    }
}

impl RingStorage for MemoryRingStorage {
    fn control_block(&self) -> &RingControlBlock {
        &self.shared.control
    }

    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.shared.data, 2 * self.shared.capacity as usize) }
    }

    fn capacity(&self) -> u32 {
        self.shared.capacity
    }

    fn control(&self, request: ControlRequest) -> io::Result<()> {
        if self.shared.fail_requests.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} rejected", request.name()),
            ));
        }

        if let Ok(mut requests) = self.shared.requests.lock() {
            requests.push(request);
        }
        Ok(())
    }
}

/// Producer handle of a [`MemoryRingStorage`]
#[derive(Clone)]
pub struct MemoryProducer {
    shared: Arc<SharedRing>,
}

impl MemoryProducer {
    /// Bytes that can still be written without overrunning the consumer
    pub fn free_space(&self) -> u32 {
        let cap = self.shared.capacity;
        cap - 1 - self.used()
    }

    fn used(&self) -> u32 {
        let cap = u64::from(self.shared.capacity);
        let head = u64::from(self.head());
        let tail = u64::from(self.tail());
        ((head + cap - tail % cap) % cap) as u32
    }

    /// Appends `bytes` at the head and publishes the new head
    pub fn write(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let available = self.free_space();
        if bytes.len() > available as usize {
            return Err(StorageError::NoSpace {
                requested: bytes.len(),
                available,
            });
        }

        let cap = self.shared.capacity as usize;
        let head = self.head() as usize % cap;
        let first = bytes.len().min(cap - head);

        unsafe {
            self.copy_mirrored(head, &bytes[..first]);
            self.copy_mirrored(0, &bytes[first..]);
        }

        let new_head = (head + bytes.len()) % cap;
        self.shared.control.produce_head(new_head as u32);
        Ok(())
    }

    // Writes at `pos` in both halves of the data region.
    unsafe fn copy_mirrored(&self, pos: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let cap = self.shared.capacity as usize;
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.shared.data.add(pos), bytes.len());
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.shared.data.add(pos + cap), bytes.len());
    }

    pub fn head(&self) -> u32 {
        self.shared.control.head()
    }

    pub fn tail(&self) -> u32 {
        self.shared.control.tail()
    }

    /// Overwrites the head without writing data
    pub fn set_head(&self, head: u32) {
        self.shared.control.produce_head(head);
    }

    /// Overwrites the consumer tail, as a misbehaving producer would
    pub fn set_tail(&self, tail: u32) {
        self.shared.control.force_tail(tail);
    }

    pub fn set_counters(&self, counters: RingCounters) {
        self.shared.control.store_counters(counters);
    }

    /// Control requests received so far
    pub fn requests(&self) -> Vec<ControlRequest> {
        self.shared
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Makes every following control request fail
    pub fn fail_requests(&self, fail: bool) {
        self.shared.fail_requests.store(fail, Ordering::Relaxed);
    }
}
