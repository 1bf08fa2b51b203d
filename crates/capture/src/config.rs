use std::path::PathBuf;
use std::time::Duration;

use ppm_ring::{BUFFER_EMPTY_WAIT_TIME, RING_BUF_SIZE};

/// Settings for opening a live capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    /// Device nodes are `<device_prefix><cpu>`
    pub device_prefix: String,
    /// Ring capacity the driver was built with
    pub ring_capacity: u32,
    /// Initial empty-buffer timeout, zero disables the merge sleep
    pub empty_buffer_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            device_prefix: "/dev/sysdig".to_string(),
            ring_capacity: RING_BUF_SIZE,
            empty_buffer_timeout: BUFFER_EMPTY_WAIT_TIME,
        }
    }
}

impl LiveConfig {
    /// Path of the device node for `device`
    pub fn device_path(&self, device: u16) -> PathBuf {
        PathBuf::from(format!("{}{}", self.device_prefix, device))
    }
}
