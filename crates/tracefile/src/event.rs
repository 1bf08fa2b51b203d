use plain::Plain;
use std::mem::size_of;
use thiserror::Error;

/// Fixed header at the start of every event record
///
/// `len` is the length of the whole record, header included. Fields are in
/// the byte order of the host that produced the record.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EventHeader {
    pub ts: u64,
    pub tid: u64,
    pub len: u32,
    pub type_: u16,
}
unsafe impl Plain for EventHeader {}

pub const EVENT_HEADER_SIZE: usize = size_of::<EventHeader>();

impl EventHeader {
    /// Reads the header at the start of `bytes`, if there is room for one
    pub fn peek(bytes: &[u8]) -> Option<EventHeader> {
        plain::from_bytes::<EventHeader>(bytes).ok().copied()
    }
}

/// Errors for records that do not hold together
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("record of {0} bytes is shorter than an event header")]
    TooShort(usize),

    #[error("event declares {declared} bytes but the record holds {available}")]
    LengthMismatch { declared: u32, available: usize },
}

/// A borrowed, validated event record
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    header: EventHeader,
    bytes: &'a [u8],
}

impl<'a> Event<'a> {
    /// Wraps a complete record; its declared length must match `bytes`
    pub fn parse(bytes: &'a [u8]) -> Result<Self, EventError> {
        let header = EventHeader::peek(bytes).ok_or(EventError::TooShort(bytes.len()))?;

        let declared = header.len;
        if declared as usize != bytes.len() {
            return Err(EventError::LengthMismatch {
                declared,
                available: bytes.len(),
            });
        }

        Ok(Event { header, bytes })
    }

    pub fn header(&self) -> EventHeader {
        self.header
    }

    /// Producer timestamp in nanoseconds
    pub fn ts(&self) -> u64 {
        self.header.ts
    }

    pub fn tid(&self) -> u64 {
        self.header.tid
    }

    pub fn len(&self) -> u32 {
        self.header.len
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    pub fn event_type(&self) -> u16 {
        self.header.type_
    }

    /// Bytes following the header
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[EVENT_HEADER_SIZE..]
    }

    /// The whole record, header included
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Builds a record the way the driver lays it out
pub fn encode_event(ts: u64, tid: u64, event_type: u16, payload: &[u8]) -> Vec<u8> {
    let header = EventHeader {
        ts,
        tid,
        len: (EVENT_HEADER_SIZE + payload.len()) as u32,
        type_: event_type,
    };

    let mut record = Vec::with_capacity(EVENT_HEADER_SIZE + payload.len());
    record.extend_from_slice(unsafe { plain::as_bytes(&header) });
    record.extend_from_slice(payload);
    record
}
