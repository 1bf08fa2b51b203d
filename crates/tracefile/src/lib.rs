//! # tracefile
//!
//! Event records as produced by the capture driver, the bootstrap tables
//! attached to a capture (machine, processes, interfaces, users) and the
//! block-structured trace file used to record and replay captures.
//!
//! [`TraceReader`] is the offline event source; [`Dumper`] writes files it
//! can read back.

mod bootstrap;
mod dumper;
mod event;
mod format;
mod reader;

pub use bootstrap::*;
pub use dumper::*;
pub use event::*;
pub use format::{
    BLOCK_EVENT, BLOCK_INTERFACE_LIST, BLOCK_MACHINE_INFO, BLOCK_PROCESS_LIST, BLOCK_USER_LIST,
    FILE_READ_BUF_SIZE, SECTION_MAGIC, VERSION_MAJOR, VERSION_MINOR,
};
pub use reader::*;

use std::io;
use thiserror::Error;

/// Errors that can occur when reading or writing trace files
#[derive(Error, Debug)]
pub enum TraceFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a trace file (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported trace file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("invalid length {length} for block of type {block_type:#x}")]
    InvalidBlockLength { block_type: u32, length: u32 },

    #[error("block of type {block_type:#x} has trailer {trailer}, expected {expected}")]
    TrailerMismatch {
        block_type: u32,
        expected: u32,
        trailer: u32,
    },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("event record of {0} bytes exceeds the read buffer")]
    EventTooLarge(usize),

    #[error("invalid event: {0}")]
    Event(#[from] EventError),
}
