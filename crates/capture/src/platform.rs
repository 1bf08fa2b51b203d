#![cfg(target_os = "linux")]

use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

use nix::sys::socket::SockaddrStorage;
use tracefile::{
    Bootstrap, GroupInfo, InterfaceAddress, InterfaceList, MachineInfo, ProcessTable, ThreadInfo,
    UserInfo, UserList,
};

use crate::CaptureError;

/// Number of online CPUs, which is also the number of capture devices
pub fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Collects the bootstrap tables of the running system
pub fn scan_platform() -> Result<Bootstrap, CaptureError> {
    let machine_info = machine_info();
    let interfaces = interface_list().map_err(|source| CaptureError::Bootstrap {
        what: "interface list",
        source,
    })?;
    let users = user_list(Path::new("/etc/passwd"), Path::new("/etc/group"));
    let processes = scan_processes(Path::new("/proc")).map_err(|source| CaptureError::Bootstrap {
        what: "process list",
        source,
    })?;

    log::debug!(
        "platform scan: {} cpus, {} threads, {} interface addresses, {} users",
        machine_info.num_cpus,
        processes.len(),
        interfaces.addresses.len(),
        users.users.len()
    );

    Ok(Bootstrap {
        machine_info: Some(machine_info),
        processes,
        interfaces,
        users,
    })
}

pub fn machine_info() -> MachineInfo {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let memory_size_bytes = u64::try_from(pages).unwrap_or(0) * page_size::get() as u64;

    let hostname = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("could not read the hostname: {}", e);
            String::new()
        }
    };

    MachineInfo {
        num_cpus: online_cpus() as u32,
        memory_size_bytes,
        hostname,
    }
}

fn to_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }
    addr.as_sockaddr_in6()
        .map(|v6| IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
}

/// IPv4 and IPv6 addresses of every interface
pub fn interface_list() -> io::Result<InterfaceList> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(io::Error::from)?;

    let addresses = addrs
        .filter_map(|ifaddr| {
            let address = ifaddr.address.as_ref().and_then(to_ip)?;
            Some(InterfaceAddress {
                name: ifaddr.interface_name,
                address,
                netmask: ifaddr.netmask.as_ref().and_then(to_ip),
            })
        })
        .collect();

    Ok(InterfaceList { addresses })
}

/// Users and groups from passwd/group style files
///
/// Missing files degrade to empty lists.
pub fn user_list(passwd: &Path, group: &Path) -> UserList {
    let read = |path: &Path| match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("could not read {}: {}", path.display(), e);
            String::new()
        }
    };

    UserList {
        users: parse_passwd(&read(passwd)),
        groups: parse_group(&read(group)),
    }
}

pub fn parse_passwd(contents: &str) -> Vec<UserInfo> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(UserInfo {
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                name: fields[0].to_string(),
                homedir: fields[5].to_string(),
                shell: fields[6].to_string(),
            })
        })
        .collect()
}

pub fn parse_group(contents: &str) -> Vec<GroupInfo> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let _password = fields.next()?;
            let gid = fields.next()?.parse().ok()?;
            Some(GroupInfo {
                gid,
                name: name.to_string(),
            })
        })
        .collect()
}

/// Reads every thread under a procfs mount
///
/// Processes that exit during the scan are skipped.
pub fn scan_processes(proc_root: &Path) -> io::Result<ProcessTable> {
    let mut table = ProcessTable::new();

    for entry in fs::read_dir(proc_root)? {
        let entry = entry?;
        let pid: i64 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let tasks = match fs::read_dir(entry.path().join("task")) {
            Ok(tasks) => tasks,
            Err(_) => continue,
        };

        let exe = fs::read_link(entry.path().join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        for task in tasks.flatten() {
            let tid: i64 = match task.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(tid) => tid,
                None => continue,
            };
            let dir = task.path();

            let comm = match fs::read_to_string(dir.join("comm")) {
                Ok(comm) => comm.trim_end_matches('\n').to_string(),
                Err(_) => continue,
            };
            let args = fs::read(dir.join("cmdline"))
                .map(|raw| split_cmdline(&raw))
                .unwrap_or_default();

            table.insert(ThreadInfo {
                tid,
                pid,
                flags: 0,
                comm,
                exe: exe.clone(),
                args,
            });
        }
    }

    Ok(table)
}

fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}
