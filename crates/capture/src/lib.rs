//! # capture
//!
//! Capture sessions over the driver's per-CPU rings or a recorded trace
//! file. A live session merges the per-CPU streams into one sequence
//! ordered by timestamp; an offline session replays a file written by
//! [`tracefile::Dumper`]. Both are driven through [`Capture::next`].

mod config;
mod device;
mod error;
#[cfg(target_os = "linux")]
mod platform;
mod session;
mod stats;

pub use config::*;
pub use device::*;
pub use error::*;
#[cfg(target_os = "linux")]
pub use platform::*;
pub use session::*;
pub use stats::*;
