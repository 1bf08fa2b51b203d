use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};

use crate::format::{
    encode_block, encode_interface_list, encode_machine_info, encode_process_list,
    encode_section_header, encode_user_list, BLOCK_OVERHEAD,
};
use crate::{
    Bootstrap, Event, TraceFileError, BLOCK_EVENT, BLOCK_INTERFACE_LIST, BLOCK_MACHINE_INFO,
    BLOCK_PROCESS_LIST, BLOCK_USER_LIST, FILE_READ_BUF_SIZE,
};

/// Writes captured events to a trace file
///
/// The section header and bootstrap blocks are written on creation, so a
/// dumper that never sees an event still leaves a valid, empty trace.
pub struct Dumper<W: Write> {
    writer: W,
    written: u64,
    scratch: BytesMut,
}

impl Dumper<BufWriter<File>> {
    /// Creates (or truncates) the file at `path`
    pub fn create(path: &Path, bootstrap: &Bootstrap) -> Result<Self, TraceFileError> {
        let file = File::create(path)?;
        log::debug!("writing trace file {}", path.display());
        Self::new(BufWriter::new(file), bootstrap)
    }
}

impl<W: Write> Dumper<W> {
    pub fn new(writer: W, bootstrap: &Bootstrap) -> Result<Self, TraceFileError> {
        let mut dumper = Dumper {
            writer,
            written: 0,
            scratch: BytesMut::with_capacity(FILE_READ_BUF_SIZE),
        };

        encode_section_header(&mut dumper.scratch);
        if let Some(info) = &bootstrap.machine_info {
            encode_block(
                &mut dumper.scratch,
                BLOCK_MACHINE_INFO,
                &encode_machine_info(info),
            );
        }
        encode_block(
            &mut dumper.scratch,
            BLOCK_PROCESS_LIST,
            &encode_process_list(&bootstrap.processes),
        );
        encode_block(
            &mut dumper.scratch,
            BLOCK_INTERFACE_LIST,
            &encode_interface_list(&bootstrap.interfaces),
        );
        encode_block(
            &mut dumper.scratch,
            BLOCK_USER_LIST,
            &encode_user_list(&bootstrap.users),
        );
        dumper.write_scratch()?;

        Ok(dumper)
    }

    /// Appends one event captured on device `cpuid`
    pub fn dump(&mut self, cpuid: u16, event: &Event<'_>) -> Result<(), TraceFileError> {
        let record = event.as_bytes();
        if record.len() > FILE_READ_BUF_SIZE {
            return Err(TraceFileError::EventTooLarge(record.len()));
        }

        // Same framing as encode_block, with the cpuid prefix written in place
        let total_len = (BLOCK_OVERHEAD + 2 + record.len()) as u32;
        self.scratch.put_u32_le(BLOCK_EVENT);
        self.scratch.put_u32_le(total_len);
        self.scratch.put_u16_le(cpuid);
        self.scratch.put_slice(record);
        self.scratch.put_u32_le(total_len);
        self.write_scratch()
    }

    /// Bytes handed to the writer so far, including headers
    pub fn written_bytes(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<(), TraceFileError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and returns the underlying writer
    pub fn into_inner(mut self) -> Result<W, TraceFileError> {
        self.flush()?;
        Ok(self.writer)
    }

    fn write_scratch(&mut self) -> Result<(), TraceFileError> {
        let result = self.writer.write_all(&self.scratch);
        let len = self.scratch.len() as u64;
        self.scratch.clear();
        result?;
        self.written += len;
        Ok(())
    }
}
