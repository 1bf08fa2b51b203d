use std::io;

use ppm_ring::{RingError, StorageError};
use thiserror::Error;
use tracefile::TraceFileError;

/// Longest message kept by [`crate::Capture::last_error`], in bytes
pub const LASTERR_SIZE: usize = 256;

/// Errors that can occur when opening or driving a capture
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device {device}: {source}")]
    Setup { device: u16, source: StorageError },

    #[error("device {device}: {source}")]
    Ring { device: u16, source: RingError },

    #[error("buffer corruption on device {device}: event of {len} bytes with {available} bytes left")]
    Corruption { device: u16, len: u32, available: u32 },

    #[error("{0} not supported on offline captures")]
    Unsupported(&'static str),

    #[error("{request} failed for device {device}: {source}")]
    Control {
        device: u16,
        request: &'static str,
        source: io::Error,
    },

    #[error("invalid device count {0}")]
    InvalidDeviceCount(usize),

    #[error("error creating the {what}: {source}")]
    Bootstrap {
        what: &'static str,
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("trace file error: {0}")]
    TraceFile(#[from] TraceFileError),
}

impl CaptureError {
    /// True for errors reporting inconsistent ring state or event lengths
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CaptureError::Corruption { .. }
                | CaptureError::Ring {
                    source: RingError::Corruption { .. },
                    ..
                }
        )
    }
}

/// Renders `error` as a message of at most [`LASTERR_SIZE`] bytes
pub(crate) fn bounded_message(error: &CaptureError) -> String {
    let mut message = error.to_string();
    if message.len() > LASTERR_SIZE {
        let mut end = LASTERR_SIZE;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
