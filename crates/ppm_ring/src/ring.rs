use std::io;
use std::sync::atomic::{fence, Ordering};
use thiserror::Error;

use crate::{
    ControlRequest, RingCounters, RingStorage, WaitStrategy, BUFFER_EMPTY_WAIT_TIME,
    MIN_USERSPACE_READ_SIZE,
};

/// Errors that can occur when reading from a device ring
#[derive(Error, Debug)]
pub enum RingError {
    #[error("buffer corruption. H={head}, T={tail}, R={read_size}, S={capacity} ({computed})")]
    Corruption {
        head: u32,
        tail: u32,
        read_size: u64,
        capacity: u32,
        computed: u64,
    },

    #[error("storage data region is {actual} bytes, expected {expected}")]
    InvalidStorage { expected: usize, actual: usize },
}

/// A readable region of the ring's data, as handed out by [`PpmRing::refill`]
///
/// `offset` indexes the mirrored data region, so `offset + len` never
/// exceeds twice the capacity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: u32,
    pub len: u32,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Pointers {
    head: u32,
    tail: u32,
    read_size: u64,
}

/// PpmRing is the consumer of one device ring
///
/// The window returned by a refill stays valid until the next refill: the
/// tail only moves past it at the start of that next call, so callers can
/// interpret event bytes in place.
pub struct PpmRing {
    storage: Box<dyn RingStorage>,
    capacity: u32,
    min_read_size: u32,
    // Size of the window served by the previous refill
    last_read_size: u32,
}

impl PpmRing {
    /// Wraps a storage, checking that its data region is mirrored
    pub fn new(storage: Box<dyn RingStorage>) -> Result<Self, RingError> {
        let capacity = storage.capacity();
        let expected = 2 * capacity as usize;
        let actual = storage.data().len();
        if capacity == 0 || actual != expected {
            return Err(RingError::InvalidStorage { expected, actual });
        }

        // Small rings can never hold the default threshold; half the ring keeps
        // blocking refills finite.
        let min_read_size = MIN_USERSPACE_READ_SIZE.min(capacity / 2).max(1);

        Ok(PpmRing {
            storage,
            capacity,
            min_read_size,
            last_read_size: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Backlog a blocking refill waits for
    pub fn min_read_size(&self) -> u32 {
        self.min_read_size
    }

    pub fn set_min_read_size(&mut self, min_read_size: u32) {
        self.min_read_size = min_read_size;
    }

    /// Consumes the previously served window and returns the next one
    ///
    /// With `blocking` set, keeps polling through `wait` until at least
    /// [`PpmRing::min_read_size`] bytes are available.
    pub fn refill(
        &mut self,
        blocking: bool,
        wait: &mut dyn WaitStrategy,
    ) -> Result<Window, RingError> {
        let cb = self.storage.control_block();
        let cap = u64::from(self.capacity);

        // The caller is done with the previous window now, not when it was served.
        let advanced = u64::from(cb.tail()) + u64::from(self.last_read_size);
        let new_tail = if advanced < cap { advanced } else { advanced - cap };

        // Every read of the old window must complete before the producer may reuse it.
        fence(Ordering::SeqCst);
        cb.publish_tail(new_tail as u32);

        let mut ptrs = self.pointers();
        if blocking {
            while ptrs.read_size < u64::from(self.min_read_size) {
                wait.wait(BUFFER_EMPTY_WAIT_TIME);
                ptrs = self.pointers();
            }
        }

        let computed = u64::from(ptrs.tail).wrapping_add(ptrs.read_size) % cap;
        let in_bounds = u64::from(ptrs.head) < cap && u64::from(ptrs.tail) < cap;
        if !in_bounds || computed != u64::from(ptrs.head) {
            self.last_read_size = 0;
            return Err(RingError::Corruption {
                head: ptrs.head,
                tail: ptrs.tail,
                read_size: ptrs.read_size,
                capacity: self.capacity,
                computed,
            });
        }

        // read_size < capacity once the check above holds
        self.last_read_size = ptrs.read_size as u32;

        Ok(Window {
            offset: ptrs.tail,
            len: self.last_read_size,
        })
    }

    /// Bytes between tail and head, without consuming anything
    ///
    /// Includes the window currently being served.
    pub fn pending(&self) -> u64 {
        self.pointers().read_size
    }

    fn pointers(&self) -> Pointers {
        let cb = self.storage.control_block();
        let head = cb.head();
        let tail = cb.tail();
        let cap = u64::from(self.capacity);

        let read_size = if tail > head {
            cap.wrapping_sub(u64::from(tail)).wrapping_add(u64::from(head))
        } else {
            u64::from(head - tail)
        };

        Pointers {
            head,
            tail,
            read_size,
        }
    }

    /// Returns the bytes of a window previously returned by [`PpmRing::refill`]
    /// (or a sub-range of one)
    ///
    /// Ranges outside the mirrored data region yield an empty slice.
    pub fn bytes(&self, window: Window) -> &[u8] {
        let start = window.offset as usize;
        let end = start + window.len as usize;
        self.storage.data().get(start..end).unwrap_or(&[])
    }

    /// Cumulative producer counters of this ring
    pub fn counters(&self) -> RingCounters {
        self.storage.control_block().counters()
    }

    /// Forwards a control request to the device
    pub fn control(&self, request: ControlRequest) -> io::Result<()> {
        self.storage.control(request)
    }
}
