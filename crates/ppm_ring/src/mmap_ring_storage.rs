#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;

use libc::{c_void, mmap, munmap, MAP_SHARED, PROT_READ, PROT_WRITE};

use crate::{ControlRequest, RingControlBlock, RingStorage, StorageError};

const PPM_IOCTL_MAGIC: u8 = b's';

fn ioctl_code(request: &ControlRequest) -> nix::sys::ioctl::ioctl_num_type {
    match request {
        ControlRequest::DisableCapture => nix::request_code_none!(PPM_IOCTL_MAGIC, 0),
        ControlRequest::EnableCapture => nix::request_code_none!(PPM_IOCTL_MAGIC, 1),
        ControlRequest::DisableDropping => nix::request_code_none!(PPM_IOCTL_MAGIC, 2),
        ControlRequest::EnableDropping { .. } => nix::request_code_none!(PPM_IOCTL_MAGIC, 3),
        ControlRequest::SetSnaplen(_) => nix::request_code_none!(PPM_IOCTL_MAGIC, 4),
    }
}

fn ioctl_arg(request: &ControlRequest) -> libc::c_ulong {
    match *request {
        ControlRequest::EnableDropping { sampling_ratio } => libc::c_ulong::from(sampling_ratio),
        ControlRequest::SetSnaplen(snaplen) => libc::c_ulong::from(snaplen),
        _ => 0,
    }
}

/// One shared mapping of a device, unmapped on drop
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(file: &File, len: usize, prot: libc::c_int) -> io::Result<Self> {
        let addr = unsafe { mmap(ptr::null_mut(), len, prot, MAP_SHARED, file.as_raw_fd(), 0) };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(addr as *mut u8)
            .map(|ptr| Mapping { ptr, len })
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

/// Ring storage backed by a capture driver device node
///
/// The driver distinguishes the two mappings by length: a mapping of
/// `2 * capacity` bytes yields the mirrored data region, a mapping the size
/// of the control block yields the control block.
///
/// This implementation is only available on Linux platforms.
pub struct MmapRingStorage {
    // Declaration order matters: both mappings are released before the fd closes.
    control: Mapping,
    data: Mapping,
    capacity: u32,
    file: File,
}

// Safety: the control block is only accessed through atomics and the data
// region is only read; the kernel is the sole writer.
unsafe impl Send for MmapRingStorage {}

impl MmapRingStorage {
    /// Opens and maps the device at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The device node, e.g. `/dev/sysdig0`
    /// * `capacity` - The ring capacity the driver was built with
    pub fn open(path: &Path, capacity: u32) -> Result<Self, StorageError> {
        let page_size = page_size::get();
        if capacity == 0 || capacity as usize % page_size != 0 {
            return Err(StorageError::InvalidCapacity {
                capacity,
                page_size,
            });
        }

        let display = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| StorageError::Open {
                path: display.clone(),
                source,
            })?;

        let data =
            Mapping::new(&file, 2 * capacity as usize, PROT_READ).map_err(|source| {
                StorageError::Map {
                    path: display.clone(),
                    what: "ring buffer",
                    source,
                }
            })?;

        let control = Mapping::new(&file, size_of::<RingControlBlock>(), PROT_READ | PROT_WRITE)
            .map_err(|source| StorageError::Map {
                path: display.clone(),
                what: "ring buffer info",
                source,
            })?;

        log::debug!("mapped device {} ({} byte ring)", display, capacity);

        Ok(MmapRingStorage {
            control,
            data,
            capacity,
            file,
        })
    }
}

impl RingStorage for MmapRingStorage {
    fn control_block(&self) -> &RingControlBlock {
        unsafe { &*(self.control.ptr.as_ptr() as *const RingControlBlock) }
    }

    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data.ptr.as_ptr(), self.data.len) }
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn control(&self, request: ControlRequest) -> io::Result<()> {
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ioctl_code(&request) as _,
                ioctl_arg(&request),
            )
        };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
