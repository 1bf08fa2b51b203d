use std::time::Duration;

use ppm_ring::{
    ControlRequest, PpmRing, RingCounters, WaitStrategy, Window, BUFFER_EMPTY_WAIT_TIME,
};
use tracefile::{Event, EventHeader, EVENT_HEADER_SIZE};

use crate::CaptureError;

/// Backlog above which the merge never sleeps, in bytes
pub const BUFFER_HIGH_WATER: u64 = 100_000;

struct Device {
    ring: PpmRing,
    window: Window,
    // Bytes of `window` already handed out
    consumed: u32,
}

impl Device {
    fn remaining(&self) -> u32 {
        self.window.len - self.consumed
    }

    fn cursor(&self) -> Window {
        Window {
            offset: self.window.offset + self.consumed,
            len: self.remaining(),
        }
    }
}

/// The rings of a live capture, merged into one time-ordered stream
///
/// Each device keeps the window served by its last refill and a cursor into
/// it. A device is only refilled once its window is fully consumed, so the
/// bytes of the event returned by [`DeviceSet::next`] stay valid until the
/// next call.
pub struct DeviceSet {
    devices: Vec<Device>,
    wait: Box<dyn WaitStrategy>,
}

impl DeviceSet {
    /// Builds a set over `rings`; device ids are their positions
    pub fn new(rings: Vec<PpmRing>, wait: Box<dyn WaitStrategy>) -> Result<Self, CaptureError> {
        if rings.is_empty() || rings.len() > usize::from(u16::MAX) {
            return Err(CaptureError::InvalidDeviceCount(rings.len()));
        }

        let devices = rings
            .into_iter()
            .map(|ring| Device {
                ring,
                window: Window::default(),
                consumed: 0,
            })
            .collect();

        Ok(DeviceSet { devices, wait })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Producer counters of every device, in device order
    pub fn counters(&self) -> impl Iterator<Item = RingCounters> + '_ {
        self.devices.iter().map(|d| d.ring.counters())
    }

    /// Sends `request` to every device, stopping at the first failure
    pub fn control_all(&self, request: ControlRequest) -> Result<(), CaptureError> {
        for device in 0..self.devices.len() {
            self.control(device as u16, request)?;
        }
        Ok(())
    }

    /// Sends `request` to one device
    pub fn control(&self, device: u16, request: ControlRequest) -> Result<(), CaptureError> {
        let ring = &self
            .devices
            .get(usize::from(device))
            .ok_or(CaptureError::InvalidDeviceCount(usize::from(device)))?
            .ring;

        log::debug!("{} on device {}", request.name(), device);

        ring.control(request).map_err(|source| CaptureError::Control {
            device,
            request: request.name(),
            source,
        })
    }

    /// Returns the earliest buffered event across all devices
    ///
    /// Devices whose window is used up are refilled first. When
    /// `empty_buffer_timeout` is non-zero and no device has a large backlog,
    /// the first such refill is preceded by a single pause of
    /// [`BUFFER_EMPTY_WAIT_TIME`]. `Ok(None)` means no device had data.
    pub fn next(
        &mut self,
        empty_buffer_timeout: Duration,
    ) -> Result<Option<(u16, Event<'_>)>, CaptureError> {
        self.refill_exhausted(empty_buffer_timeout)?;

        // (device, ts, len) of the earliest event seen so far
        let mut winner: Option<(usize, u64, u32)> = None;
        for (idx, device) in self.devices.iter().enumerate() {
            if device.remaining() == 0 {
                continue;
            }

            let header = match EventHeader::peek(device.ring.bytes(device.cursor())) {
                Some(header) => header,
                None => {
                    return Err(corruption(
                        idx,
                        EVENT_HEADER_SIZE as u32,
                        device.remaining(),
                    ))
                }
            };

            let ts = header.ts;
            if winner.map_or(true, |(_, best, _)| ts < best) {
                winner = Some((idx, ts, header.len));
            }
        }

        let (idx, _, len) = match winner {
            Some(winner) => winner,
            None => return Ok(None),
        };

        let available = self.devices[idx].remaining();
        if (len as usize) < EVENT_HEADER_SIZE || len > available {
            return Err(corruption(idx, len, available));
        }

        let device = &mut self.devices[idx];
        let record = Window {
            offset: device.window.offset + device.consumed,
            len,
        };
        device.consumed += len;

        let device = &self.devices[idx];
        let event = Event::parse(device.ring.bytes(record))
            .map_err(|_| corruption(idx, len, available))?;

        Ok(Some((idx as u16, event)))
    }

    fn refill_exhausted(&mut self, empty_buffer_timeout: Duration) -> Result<(), CaptureError> {
        let mut waited = false;

        for idx in 0..self.devices.len() {
            if self.devices[idx].remaining() != 0 {
                continue;
            }

            if !empty_buffer_timeout.is_zero() && !waited && self.below_high_water() {
                self.wait.wait(BUFFER_EMPTY_WAIT_TIME);
                waited = true;
            }

            let device = &mut self.devices[idx];
            let window = device
                .ring
                .refill(false, &mut *self.wait)
                .map_err(|source| {
                    log::error!("device {}: {}", idx, source);
                    CaptureError::Ring {
                        device: idx as u16,
                        source,
                    }
                })?;
            device.window = window;
            device.consumed = 0;
        }
        Ok(())
    }

    fn below_high_water(&self) -> bool {
        self.devices
            .iter()
            .all(|d| d.ring.pending() <= BUFFER_HIGH_WATER)
    }
}

fn corruption(device: usize, len: u32, available: u32) -> CaptureError {
    let err = CaptureError::Corruption {
        device: device as u16,
        len,
        available,
    };
    log::error!("{}", err);
    err
}
