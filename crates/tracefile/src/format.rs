//! Block layout of trace files
//!
//! A file starts with an 8 byte section header (magic, major, minor) and
//! continues with blocks of the form `type:u32 total_len:u32 body total_len:u32`.
//! Everything except event records is little endian. Strings are a `u16`
//! byte count followed by UTF-8.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    Bootstrap, GroupInfo, InterfaceAddress, InterfaceList, MachineInfo, ProcessTable, ThreadInfo,
    TraceFileError, UserInfo, UserList,
};

pub const SECTION_MAGIC: u32 = 0x1A2B_3C4D;
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

pub const BLOCK_MACHINE_INFO: u32 = 0x201;
pub const BLOCK_PROCESS_LIST: u32 = 0x202;
pub const BLOCK_INTERFACE_LIST: u32 = 0x203;
pub const BLOCK_USER_LIST: u32 = 0x204;
pub const BLOCK_EVENT: u32 = 0x205;

/// Largest event record a reader accepts
pub const FILE_READ_BUF_SIZE: usize = 65536;

pub(crate) const SECTION_HEADER_SIZE: usize = 8;
/// Block type, total length and trailer
pub(crate) const BLOCK_OVERHEAD: usize = 12;
/// Upper bound on bootstrap block bodies, to bound allocations on corrupt input
pub(crate) const MAX_BLOCK_BODY: usize = 64 << 20;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

pub(crate) fn encode_section_header(buf: &mut BytesMut) {
    buf.put_u32_le(SECTION_MAGIC);
    buf.put_u16_le(VERSION_MAJOR);
    buf.put_u16_le(VERSION_MINOR);
}

pub(crate) fn decode_section_header(mut header: &[u8]) -> Result<(), TraceFileError> {
    if header.remaining() < SECTION_HEADER_SIZE {
        return Err(TraceFileError::Truncated("section header"));
    }

    let magic = header.get_u32_le();
    if magic != SECTION_MAGIC {
        return Err(TraceFileError::BadMagic(magic));
    }

    let major = header.get_u16_le();
    let minor = header.get_u16_le();
    if major != VERSION_MAJOR {
        return Err(TraceFileError::UnsupportedVersion { major, minor });
    }
    Ok(())
}

/// Frames `body` as a block of `block_type`
pub(crate) fn encode_block(buf: &mut BytesMut, block_type: u32, body: &[u8]) {
    let total_len = (BLOCK_OVERHEAD + body.len()) as u32;
    buf.reserve(BLOCK_OVERHEAD + body.len());
    buf.put_u32_le(block_type);
    buf.put_u32_le(total_len);
    buf.put_slice(body);
    buf.put_u32_le(total_len);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16_le(end as u16);
    buf.put_slice(&s.as_bytes()[..end]);
}

fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&v6.octets());
        }
    }
}

pub(crate) fn encode_machine_info(info: &MachineInfo) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(info.num_cpus);
    buf.put_u64_le(info.memory_size_bytes);
    put_str(&mut buf, &info.hostname);
    buf
}

pub(crate) fn encode_process_list(processes: &ProcessTable) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(processes.len() as u32);
    for thread in processes.iter() {
        buf.put_i64_le(thread.tid);
        buf.put_i64_le(thread.pid);
        buf.put_u32_le(thread.flags);
        put_str(&mut buf, &thread.comm);
        put_str(&mut buf, &thread.exe);
        let args = &thread.args[..thread.args.len().min(u16::MAX as usize)];
        buf.put_u16_le(args.len() as u16);
        for arg in args {
            put_str(&mut buf, arg);
        }
    }
    buf
}

pub(crate) fn encode_interface_list(interfaces: &InterfaceList) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(interfaces.addresses.len() as u32);
    for iface in &interfaces.addresses {
        put_str(&mut buf, &iface.name);
        put_addr(&mut buf, &iface.address);
        match &iface.netmask {
            Some(mask) => {
                buf.put_u8(1);
                put_addr(&mut buf, mask);
            }
            None => buf.put_u8(0),
        }
    }
    buf
}

pub(crate) fn encode_user_list(users: &UserList) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(users.users.len() as u32);
    for user in &users.users {
        buf.put_u32_le(user.uid);
        buf.put_u32_le(user.gid);
        put_str(&mut buf, &user.name);
        put_str(&mut buf, &user.homedir);
        put_str(&mut buf, &user.shell);
    }
    buf.put_u32_le(users.groups.len() as u32);
    for group in &users.groups {
        buf.put_u32_le(group.gid);
        put_str(&mut buf, &group.name);
    }
    buf
}

/// Bounds-checked reads over a block body
struct Decoder<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Decoder { buf, what }
    }

    fn need(&self, n: usize) -> Result<(), TraceFileError> {
        if self.buf.remaining() < n {
            return Err(TraceFileError::Truncated(self.what));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, TraceFileError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, TraceFileError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, TraceFileError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, TraceFileError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64, TraceFileError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn slice(&mut self, n: usize) -> Result<&'a [u8], TraceFileError> {
        self.need(n)?;
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, TraceFileError> {
        let len = self.u16()? as usize;
        let bytes = self.slice(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| TraceFileError::Malformed {
            what: self.what,
            reason: e.to_string(),
        })
    }

    fn addr(&mut self) -> Result<IpAddr, TraceFileError> {
        match self.u8()? {
            FAMILY_V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(self.slice(4)?);
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.slice(16)?);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            family => Err(TraceFileError::Malformed {
                what: self.what,
                reason: format!("unknown address family {}", family),
            }),
        }
    }

    // Counts come from the file; cap preallocation by what the body could hold.
    fn count(&mut self, min_entry_size: usize) -> Result<usize, TraceFileError> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_entry_size) > self.buf.remaining() {
            return Err(TraceFileError::Truncated(self.what));
        }
        Ok(count)
    }

    fn finish(self) -> Result<(), TraceFileError> {
        if self.buf.has_remaining() {
            return Err(TraceFileError::Malformed {
                what: self.what,
                reason: format!("{} trailing bytes", self.buf.remaining()),
            });
        }
        Ok(())
    }
}

pub(crate) fn decode_machine_info(body: &[u8]) -> Result<MachineInfo, TraceFileError> {
    let mut d = Decoder::new(body, "machine info block");
    let info = MachineInfo {
        num_cpus: d.u32()?,
        memory_size_bytes: d.u64()?,
        hostname: d.string()?,
    };
    d.finish()?;
    Ok(info)
}

pub(crate) fn decode_process_list(body: &[u8]) -> Result<ProcessTable, TraceFileError> {
    let mut d = Decoder::new(body, "process list block");
    let count = d.count(8 + 8 + 4 + 2 + 2 + 2)?;

    let mut table = ProcessTable::new();
    for _ in 0..count {
        let tid = d.i64()?;
        let pid = d.i64()?;
        let flags = d.u32()?;
        let comm = d.string()?;
        let exe = d.string()?;
        let nargs = d.u16()? as usize;
        let mut args = Vec::with_capacity(nargs.min(d.buf.remaining() / 2));
        for _ in 0..nargs {
            args.push(d.string()?);
        }
        table.insert(ThreadInfo {
            tid,
            pid,
            flags,
            comm,
            exe,
            args,
        });
    }
    d.finish()?;
    Ok(table)
}

pub(crate) fn decode_interface_list(body: &[u8]) -> Result<InterfaceList, TraceFileError> {
    let mut d = Decoder::new(body, "interface list block");
    let count = d.count(2 + 5 + 1)?;

    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        let name = d.string()?;
        let address = d.addr()?;
        let netmask = match d.u8()? {
            0 => None,
            _ => Some(d.addr()?),
        };
        addresses.push(InterfaceAddress {
            name,
            address,
            netmask,
        });
    }
    d.finish()?;
    Ok(InterfaceList { addresses })
}

pub(crate) fn decode_user_list(body: &[u8]) -> Result<UserList, TraceFileError> {
    let mut d = Decoder::new(body, "user list block");

    let nusers = d.count(4 + 4 + 2 + 2 + 2)?;
    let mut users = Vec::with_capacity(nusers);
    for _ in 0..nusers {
        users.push(UserInfo {
            uid: d.u32()?,
            gid: d.u32()?,
            name: d.string()?,
            homedir: d.string()?,
            shell: d.string()?,
        });
    }

    let ngroups = d.count(4 + 2)?;
    let mut groups = Vec::with_capacity(ngroups);
    for _ in 0..ngroups {
        groups.push(GroupInfo {
            gid: d.u32()?,
            name: d.string()?,
        });
    }
    d.finish()?;
    Ok(UserList { users, groups })
}

/// Applies a bootstrap block to `bootstrap`; returns false for unknown types
pub(crate) fn apply_bootstrap_block(
    bootstrap: &mut Bootstrap,
    block_type: u32,
    body: &[u8],
) -> Result<bool, TraceFileError> {
    match block_type {
        BLOCK_MACHINE_INFO => bootstrap.machine_info = Some(decode_machine_info(body)?),
        BLOCK_PROCESS_LIST => bootstrap.processes = decode_process_list(body)?,
        BLOCK_INTERFACE_LIST => bootstrap.interfaces = decode_interface_list(body)?,
        BLOCK_USER_LIST => bootstrap.users = decode_user_list(body)?,
        _ => return Ok(false),
    }
    Ok(true)
}
