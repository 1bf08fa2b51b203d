//! # ppm_ring
//!
//! Consumer side of the capture driver's per-CPU ring buffers. The kernel
//! driver produces event records into one shared ring per online CPU; this
//! crate maps those rings, advances the consumer tail and hands out
//! contiguous readable windows without copying.
//!

mod control;
mod memory_ring_storage;
#[cfg(target_os = "linux")]
mod mmap_ring_storage;
mod ring;
mod wait;

pub use control::*;
pub use memory_ring_storage::*;
#[cfg(target_os = "linux")]
pub use mmap_ring_storage::*;
pub use ring::*;
pub use wait::*;

use std::io;
use thiserror::Error;

/// Errors that can occur when acquiring or driving ring storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error opening device {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("error mapping the {what} for device {path}: {source}")]
    Map {
        path: String,
        what: &'static str,
        source: io::Error,
    },

    #[error("ring capacity {capacity} must be a non-zero multiple of the page size ({page_size})")]
    InvalidCapacity { capacity: u32, page_size: usize },

    #[error("not enough space in ring: requested {requested} bytes, {available} available")]
    NoSpace { requested: usize, available: u32 },
}

/// Out-of-band requests understood by the capture driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    DisableCapture,
    EnableCapture,
    DisableDropping,
    EnableDropping { sampling_ratio: u32 },
    SetSnaplen(u32),
}

impl ControlRequest {
    /// Short human readable name, used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::DisableCapture => "stop capture",
            ControlRequest::EnableCapture => "start capture",
            ControlRequest::DisableDropping => "stop dropping mode",
            ControlRequest::EnableDropping { .. } => "start dropping mode",
            ControlRequest::SetSnaplen(_) => "set snaplen",
        }
    }
}

/// Backing memory of one device ring
///
/// The data region is `2 * capacity` bytes long and its second half mirrors
/// the first, so a window of up to `capacity` bytes starting anywhere in the
/// first half is contiguous.
pub trait RingStorage {
    /// Shared control block holding head, tail and the producer counters
    fn control_block(&self) -> &RingControlBlock;

    /// The mirrored data region
    fn data(&self) -> &[u8];

    /// Ring capacity in bytes (half the data region)
    fn capacity(&self) -> u32;

    /// Forward a control request to the producer side
    fn control(&self, request: ControlRequest) -> io::Result<()>;
}

impl<T: RingStorage + ?Sized> RingStorage for Box<T> {
    fn control_block(&self) -> &RingControlBlock {
        (**self).control_block()
    }

    fn data(&self) -> &[u8] {
        (**self).data()
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn control(&self, request: ControlRequest) -> io::Result<()> {
        (**self).control(request)
    }
}
