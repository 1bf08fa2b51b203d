use std::collections::BTreeMap;
use std::net::IpAddr;

/// Description of the machine a capture was taken on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub num_cpus: u32,
    pub memory_size_bytes: u64,
    pub hostname: String,
}

/// One thread of the process table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: i64,
    pub pid: i64,
    pub flags: u32,
    pub comm: String,
    pub exe: String,
    pub args: Vec<String>,
}

impl ThreadInfo {
    /// Placeholder thread events from kernel context are attributed to
    pub fn kernel() -> Self {
        ThreadInfo {
            tid: -1,
            pid: -1,
            flags: 0,
            comm: "kernel".to_string(),
            exe: "kernel".to_string(),
            args: Vec::new(),
        }
    }
}

/// Threads known at capture start, keyed by thread id
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessTable {
    threads: BTreeMap<i64, ThreadInfo>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a thread, replacing any previous entry with the same tid
    pub fn insert(&mut self, thread: ThreadInfo) {
        self.threads.insert(thread.tid, thread);
    }

    pub fn get(&self, tid: i64) -> Option<&ThreadInfo> {
        self.threads.get(&tid)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values()
    }
}

/// An address assigned to a network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub name: String,
    pub address: IpAddr,
    pub netmask: Option<IpAddr>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InterfaceList {
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub homedir: String,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub gid: u32,
    pub name: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserList {
    pub users: Vec<UserInfo>,
    pub groups: Vec<GroupInfo>,
}

/// Everything collected once when a capture is opened
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    /// `None` for trace files recorded without a machine info block
    pub machine_info: Option<MachineInfo>,
    pub processes: ProcessTable,
    pub interfaces: InterfaceList,
    pub users: UserList,
}
