use std::io::{self, ErrorKind, Read};

use bytes::Buf;

use crate::format::{
    apply_bootstrap_block, decode_section_header, BLOCK_OVERHEAD, MAX_BLOCK_BODY,
    SECTION_HEADER_SIZE,
};
use crate::{Bootstrap, Event, TraceFileError, BLOCK_EVENT, FILE_READ_BUF_SIZE};

/// Sequential reader of a trace file
///
/// Bootstrap blocks before the first event are consumed by
/// [`TraceReader::read_init`]; events are then returned one at a time,
/// borrowed from an internal buffer that is reused for every block.
pub struct TraceReader<R: Read> {
    reader: R,
    buf: Vec<u8>,
    // The current buffer holds an event block not yet returned
    pending: bool,
}

impl<R: Read> TraceReader<R> {
    /// Validates the section header and loads the bootstrap blocks
    ///
    /// Stops at the first event block, which is kept for the first call to
    /// [`TraceReader::next_event`]. A file holding only bootstrap blocks is
    /// valid and simply yields no events.
    pub fn read_init(reader: R) -> Result<(Self, Bootstrap), TraceFileError> {
        let mut this = TraceReader {
            reader,
            buf: Vec::with_capacity(FILE_READ_BUF_SIZE),
            pending: false,
        };

        let mut header = [0u8; SECTION_HEADER_SIZE];
        if !this.fill(&mut header, "section header")? {
            return Err(TraceFileError::Truncated("section header"));
        }
        decode_section_header(&header)?;

        let mut bootstrap = Bootstrap::default();
        while let Some(block_type) = this.read_block()? {
            if block_type == BLOCK_EVENT {
                this.pending = true;
                break;
            }
            if !apply_bootstrap_block(&mut bootstrap, block_type, &this.buf)? {
                log::warn!("skipping unknown block of type {:#x}", block_type);
            }
        }

        log::debug!(
            "loaded trace bootstrap: {} threads, {} interface addresses, {} users",
            bootstrap.processes.len(),
            bootstrap.interfaces.addresses.len(),
            bootstrap.users.users.len()
        );

        Ok((this, bootstrap))
    }

    /// Returns the next event and the id of the device it was captured on
    ///
    /// `Ok(None)` marks a clean end of file. Non-event blocks found after the
    /// first event are skipped.
    pub fn next_event(&mut self) -> Result<Option<(u16, Event<'_>)>, TraceFileError> {
        if !self.pending {
            loop {
                match self.read_block()? {
                    None => return Ok(None),
                    Some(BLOCK_EVENT) => break,
                    Some(other) => {
                        log::warn!("skipping block of type {:#x} between events", other)
                    }
                }
            }
        }
        self.pending = false;

        if self.buf.len() < 2 {
            return Err(TraceFileError::Truncated("event block"));
        }
        let mut cpuid = &self.buf[..2];
        let cpuid = cpuid.get_u16_le();
        let event = Event::parse(&self.buf[2..])?;
        Ok(Some((cpuid, event)))
    }

    /// Reads one block into `self.buf`, returning its type
    fn read_block(&mut self) -> Result<Option<u32>, TraceFileError> {
        let mut header = [0u8; 8];
        if !self.fill(&mut header, "block header")? {
            return Ok(None);
        }
        let mut h = &header[..];
        let block_type = h.get_u32_le();
        let total_len = h.get_u32_le();

        let invalid = TraceFileError::InvalidBlockLength {
            block_type,
            length: total_len,
        };
        let body_len = match (total_len as usize).checked_sub(BLOCK_OVERHEAD) {
            Some(len) => len,
            None => return Err(invalid),
        };

        if block_type == BLOCK_EVENT {
            if body_len > FILE_READ_BUF_SIZE + 2 {
                return Err(TraceFileError::EventTooLarge(body_len - 2));
            }
        } else if body_len > MAX_BLOCK_BODY {
            return Err(invalid);
        }

        self.buf.resize(body_len, 0);
        self.reader.read_exact(&mut self.buf).map_err(truncated("block body"))?;

        let mut trailer = [0u8; 4];
        self.reader.read_exact(&mut trailer).map_err(truncated("block trailer"))?;
        let trailer = u32::from_le_bytes(trailer);
        if trailer != total_len {
            return Err(TraceFileError::TrailerMismatch {
                block_type,
                expected: total_len,
                trailer,
            });
        }

        Ok(Some(block_type))
    }

    /// Fills `out` completely; false if the source was already at its end
    fn fill(&mut self, out: &mut [u8], what: &'static str) -> Result<bool, TraceFileError> {
        let mut filled = 0;
        while filled < out.len() {
            match self.reader.read(&mut out[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(TraceFileError::Truncated(what)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

fn truncated(what: &'static str) -> impl Fn(io::Error) -> TraceFileError {
    move |e| match e.kind() {
        ErrorKind::UnexpectedEof => TraceFileError::Truncated(what),
        _ => TraceFileError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_block, encode_section_header};
    use crate::{encode_event, BLOCK_MACHINE_INFO};
    use bytes::{BufMut, BytesMut};
    use std::io::Cursor;

    fn file_with(blocks: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_section_header(&mut buf);
        for (block_type, body) in blocks {
            encode_block(&mut buf, *block_type, body);
        }
        buf.to_vec()
    }

    fn event_body(cpuid: u16, record: &[u8]) -> Vec<u8> {
        let mut body = cpuid.to_le_bytes().to_vec();
        body.extend_from_slice(record);
        body
    }

    #[test]
    fn test_empty_file() {
        let result = TraceReader::read_init(Cursor::new(Vec::new()));
        assert!(matches!(
            result,
            Err(TraceFileError::Truncated("section header"))
        ));
    }

    #[test]
    fn test_header_only() {
        let (mut reader, bootstrap) = TraceReader::read_init(Cursor::new(file_with(&[]))).unwrap();
        assert_eq!(bootstrap, Bootstrap::default());
        assert!(bootstrap.machine_info.is_none());
        assert!(reader.next_event().unwrap().is_none());
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn test_events_in_file_order() {
        let first = encode_event(200, 1, 1, b"x");
        let second = encode_event(100, 2, 1, b"yy");
        let file = file_with(&[
            (BLOCK_EVENT, event_body(3, &first)),
            (BLOCK_EVENT, event_body(0, &second)),
        ]);

        let (mut reader, _) = TraceReader::read_init(Cursor::new(file)).unwrap();

        let (cpu, event) = reader.next_event().unwrap().unwrap();
        assert_eq!((cpu, event.ts(), event.payload()), (3, 200, &b"x"[..]));

        let (cpu, event) = reader.next_event().unwrap().unwrap();
        assert_eq!((cpu, event.ts(), event.payload()), (0, 100, &b"yy"[..]));

        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn test_unknown_blocks_are_skipped() {
        testing_logger::setup();

        let record = encode_event(1, 1, 1, b"");
        let file = file_with(&[
            (0x999, vec![1, 2, 3]),
            (BLOCK_EVENT, event_body(0, &record)),
            (0x998, Vec::new()),
            (BLOCK_EVENT, event_body(1, &record)),
        ]);

        let (mut reader, _) = TraceReader::read_init(Cursor::new(file)).unwrap();
        assert_eq!(reader.next_event().unwrap().unwrap().0, 0);
        assert_eq!(reader.next_event().unwrap().unwrap().0, 1);
        assert!(reader.next_event().unwrap().is_none());

        testing_logger::validate(|captured_logs| {
            let warnings: Vec<_> = captured_logs
                .iter()
                .filter(|log| log.level == log::Level::Warn)
                .collect();
            assert_eq!(warnings.len(), 2);
            assert!(warnings[0].body.contains("0x999"));
            assert!(warnings[1].body.contains("0x998"));
        });
    }

    #[test]
    fn test_truncated_event_block() {
        let record = encode_event(1, 1, 1, b"payload");
        let mut file = file_with(&[
            (BLOCK_EVENT, event_body(0, &record)),
            (BLOCK_EVENT, event_body(0, &record)),
        ]);
        file.truncate(file.len() - 6);

        let (mut reader, _) = TraceReader::read_init(Cursor::new(file)).unwrap();
        assert!(reader.next_event().unwrap().is_some());
        assert!(matches!(
            reader.next_event(),
            Err(TraceFileError::Truncated("block body"))
        ));
    }

    #[test]
    fn test_partial_block_header() {
        let mut file = file_with(&[]);
        file.extend_from_slice(&[0x05, 0x02]);

        let (mut reader, _) = TraceReader::read_init(Cursor::new(file)).unwrap();
        assert!(matches!(
            reader.next_event(),
            Err(TraceFileError::Truncated("block header"))
        ));
    }

    #[test]
    fn test_trailer_mismatch() {
        let mut file = file_with(&[(BLOCK_MACHINE_INFO, vec![0u8; 14])]);
        let len = file.len();
        file[len - 1] = 0xff;

        assert!(matches!(
            TraceReader::read_init(Cursor::new(file)),
            Err(TraceFileError::TrailerMismatch { .. })
        ));
    }

    #[test]
    fn test_block_length_below_overhead() {
        let mut buf = BytesMut::new();
        encode_section_header(&mut buf);
        buf.put_u32_le(BLOCK_EVENT);
        buf.put_u32_le(4);

        assert!(matches!(
            TraceReader::read_init(Cursor::new(buf.to_vec())),
            Err(TraceFileError::InvalidBlockLength { length: 4, .. })
        ));
    }

    #[test]
    fn test_oversized_event_is_rejected() {
        let mut buf = BytesMut::new();
        encode_section_header(&mut buf);
        buf.put_u32_le(BLOCK_EVENT);
        buf.put_u32_le((BLOCK_OVERHEAD + 2 + FILE_READ_BUF_SIZE + 1) as u32);

        assert!(matches!(
            TraceReader::read_init(Cursor::new(buf.to_vec())),
            Err(TraceFileError::EventTooLarge(65537))
        ));
    }

    #[test]
    fn test_event_with_inconsistent_length() {
        let mut record = encode_event(1, 1, 1, b"abc");
        record.push(0);
        let file = file_with(&[(BLOCK_EVENT, event_body(0, &record))]);

        let (mut reader, _) = TraceReader::read_init(Cursor::new(file)).unwrap();
        assert!(matches!(
            reader.next_event(),
            Err(TraceFileError::Event(_))
        ));
    }
}
