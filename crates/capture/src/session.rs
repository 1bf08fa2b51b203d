use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

use ppm_ring::{ControlRequest, PpmRing, RingStorage, StorageError, WaitStrategy};
use tracefile::{
    Bootstrap, Event, InterfaceList, MachineInfo, ProcessTable, ThreadInfo, TraceReader, UserList,
};

use crate::error::bounded_message;
use crate::{CaptureError, CaptureStats, DeviceSet, LiveConfig};

/// Where a capture gets its events from, fixed when it is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Offline,
}

/// Platform the library was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsPlatform {
    LinuxI386,
    LinuxX64,
    WindowsI386,
    WindowsX64,
    Unknown,
}

impl OsPlatform {
    pub fn current() -> Self {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86") => OsPlatform::LinuxI386,
            ("linux", "x86_64") => OsPlatform::LinuxX64,
            ("windows", "x86") => OsPlatform::WindowsI386,
            ("windows", "x86_64") => OsPlatform::WindowsX64,
            _ => OsPlatform::Unknown,
        }
    }
}

/// Outcome of a successful [`Capture::next`]
#[derive(Debug)]
pub enum NextEvent<'a> {
    /// An event and the device it was captured on
    Event { device: u16, event: Event<'a> },
    /// No live device had data; try again
    Timeout,
    /// The trace file is exhausted
    Eof,
}

enum Source {
    Live(DeviceSet),
    Offline(TraceReader<Box<dyn Read>>),
}

/// A capture handle
///
/// Opened once in live or offline mode, it hands out events in timestamp
/// order through [`Capture::next`] and keeps the bootstrap tables collected
/// at open time. Dropping the handle unmaps every device and closes every
/// file it holds.
pub struct Capture {
    source: Source,
    bootstrap: Bootstrap,
    kernel_thread: ThreadInfo,
    event_count: u64,
    empty_buffer_timeout: Duration,
    last_error: String,
}

impl Capture {
    /// Opens one driver device per online CPU
    #[cfg(target_os = "linux")]
    pub fn open_live(config: &LiveConfig) -> Result<Self, CaptureError> {
        let bootstrap = crate::scan_platform()?;
        let capacity = config.ring_capacity;

        Self::open_live_with(
            config,
            crate::online_cpus(),
            bootstrap,
            Box::new(ppm_ring::SleepWait),
            |device| {
                ppm_ring::MmapRingStorage::open(&config.device_path(device), capacity)
                    .map(|storage| Box::new(storage) as Box<dyn RingStorage>)
            },
        )
    }

    /// Opens a live capture over storages produced by `open_device`
    ///
    /// Devices are opened in order; if any step fails, everything opened so
    /// far is released before the error is returned. Dropping mode is reset
    /// once all devices are up.
    pub fn open_live_with<F>(
        config: &LiveConfig,
        num_devices: usize,
        bootstrap: Bootstrap,
        wait: Box<dyn WaitStrategy>,
        mut open_device: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnMut(u16) -> Result<Box<dyn RingStorage>, StorageError>,
    {
        if num_devices == 0 || num_devices > usize::from(u16::MAX) {
            return Err(CaptureError::InvalidDeviceCount(num_devices));
        }

        let mut rings = Vec::with_capacity(num_devices);
        for device in 0..num_devices as u16 {
            let storage =
                open_device(device).map_err(|source| CaptureError::Setup { device, source })?;
            let ring = PpmRing::new(storage).map_err(|source| CaptureError::Ring { device, source })?;
            rings.push(ring);
        }

        let devices = DeviceSet::new(rings, wait)?;
        devices.control(0, ControlRequest::DisableDropping)?;

        log::debug!("opened live capture on {} devices", num_devices);

        Ok(Capture {
            source: Source::Live(devices),
            bootstrap,
            kernel_thread: ThreadInfo::kernel(),
            event_count: 0,
            empty_buffer_timeout: config.empty_buffer_timeout,
            last_error: String::new(),
        })
    }

    /// Opens a trace file written by [`tracefile::Dumper`]
    pub fn open_offline(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path)?;
        log::debug!("opened trace file {}", path.display());
        Self::offline_from_reader(Box::new(BufReader::new(file)))
    }

    /// Replays a trace from any byte source
    pub fn offline_from_reader(reader: Box<dyn Read>) -> Result<Self, CaptureError> {
        let (reader, bootstrap) = TraceReader::read_init(reader)?;

        Ok(Capture {
            source: Source::Offline(reader),
            bootstrap,
            kernel_thread: ThreadInfo::kernel(),
            event_count: 0,
            empty_buffer_timeout: Duration::ZERO,
            last_error: String::new(),
        })
    }

    /// Returns the next event
    ///
    /// The event borrows the capture's buffers and must be dropped before
    /// the next call. Failures are also recorded in [`Capture::last_error`].
    pub fn next(&mut self) -> Result<NextEvent<'_>, CaptureError> {
        let result = match &mut self.source {
            Source::Live(devices) => {
                devices
                    .next(self.empty_buffer_timeout)
                    .map(|next| match next {
                        Some((device, event)) => NextEvent::Event { device, event },
                        None => NextEvent::Timeout,
                    })
            }
            Source::Offline(reader) => reader
                .next_event()
                .map_err(CaptureError::from)
                .map(|next| match next {
                    Some((device, event)) => NextEvent::Event { device, event },
                    None => NextEvent::Eof,
                }),
        };

        match result {
            Ok(next) => {
                if matches!(next, NextEvent::Event { .. }) {
                    self.event_count += 1;
                }
                Ok(next)
            }
            Err(e) => {
                self.last_error = bounded_message(&e);
                Err(e)
            }
        }
    }

    /// Producer statistics summed over all devices; zero for offline captures
    pub fn get_stats(&self) -> CaptureStats {
        match &self.source {
            Source::Live(devices) => CaptureStats::from_counters(devices.counters()),
            Source::Offline(_) => CaptureStats::default(),
        }
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        let result = self
            .live(ControlRequest::EnableCapture)
            .and_then(|devices| devices.control_all(ControlRequest::EnableCapture));
        self.record(result)
    }

    /// Stops the producers and stops waiting on empty buffers, so what is
    /// left in the rings can be drained at full speed
    pub fn stop_capture(&mut self) -> Result<(), CaptureError> {
        let result = self
            .live(ControlRequest::DisableCapture)
            .and_then(|devices| devices.control_all(ControlRequest::DisableCapture));
        if result.is_ok() {
            self.empty_buffer_timeout = Duration::ZERO;
        }
        self.record(result)
    }

    /// Makes the producer keep one event in `sampling_ratio`
    pub fn start_dropping_mode(&mut self, sampling_ratio: u32) -> Result<(), CaptureError> {
        self.control_first(ControlRequest::EnableDropping { sampling_ratio })
    }

    pub fn stop_dropping_mode(&mut self) -> Result<(), CaptureError> {
        self.control_first(ControlRequest::DisableDropping)
    }

    /// Sets the maximum number of payload bytes captured per event
    pub fn set_snaplen(&mut self, snaplen: u32) -> Result<(), CaptureError> {
        self.control_first(ControlRequest::SetSnaplen(snaplen))
    }

    pub fn set_empty_buffer_timeout(&mut self, timeout: Duration) {
        self.empty_buffer_timeout = timeout;
    }

    pub fn empty_buffer_timeout(&self) -> Duration {
        self.empty_buffer_timeout
    }

    /// Message of the most recent failure, empty if nothing failed yet
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Number of devices; zero for offline captures
    pub fn ndevs(&self) -> usize {
        match &self.source {
            Source::Live(devices) => devices.len(),
            Source::Offline(_) => 0,
        }
    }

    pub fn mode(&self) -> Mode {
        match self.source {
            Source::Live(_) => Mode::Live,
            Source::Offline(_) => Mode::Offline,
        }
    }

    /// Events returned by [`Capture::next`] so far
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// `None` when replaying a file recorded without machine information
    pub fn machine_info(&self) -> Option<&MachineInfo> {
        self.bootstrap.machine_info.as_ref()
    }

    pub fn process_table(&self) -> &ProcessTable {
        &self.bootstrap.processes
    }

    pub fn interfaces(&self) -> &InterfaceList {
        &self.bootstrap.interfaces
    }

    pub fn users(&self) -> &UserList {
        &self.bootstrap.users
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Thread that events without a user-space thread are attributed to
    pub fn kernel_thread(&self) -> &ThreadInfo {
        &self.kernel_thread
    }

    pub fn os_platform(&self) -> OsPlatform {
        OsPlatform::current()
    }

    /// Releases every device or file held by the capture
    pub fn close(self) {
        log::debug!(
            "closing {:?} capture after {} events",
            self.mode(),
            self.event_count
        );
    }

    fn live(&self, request: ControlRequest) -> Result<&DeviceSet, CaptureError> {
        match &self.source {
            Source::Live(devices) => Ok(devices),
            Source::Offline(_) => Err(CaptureError::Unsupported(request.name())),
        }
    }

    fn control_first(&mut self, request: ControlRequest) -> Result<(), CaptureError> {
        let result = self
            .live(request)
            .and_then(|devices| devices.control(0, request));
        self.record(result)
    }

    fn record(&mut self, result: Result<(), CaptureError>) -> Result<(), CaptureError> {
        if let Err(e) = &result {
            self.last_error = bounded_message(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppm_ring::{
        MemoryProducer, MemoryRingStorage, RecordingWait, RingControlBlock, RingCounters, RingError,
    };
    use std::io::{self, Cursor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracefile::{encode_event, Dumper};

    fn open_memory(n: usize) -> (Capture, Vec<MemoryProducer>, RecordingWait) {
        let storages: Vec<_> = (0..n).map(|_| MemoryRingStorage::new(4096).unwrap()).collect();
        let producers = storages.iter().map(|s| s.producer()).collect();
        let mut storages = storages.into_iter();
        let wait = RecordingWait::new();

        let capture = Capture::open_live_with(
            &LiveConfig::default(),
            n,
            Bootstrap::default(),
            Box::new(wait.clone()),
            |_| match storages.next() {
                Some(storage) => Ok(Box::new(storage) as Box<dyn RingStorage>),
                None => Err(StorageError::NoSpace {
                    requested: 0,
                    available: 0,
                }),
            },
        )
        .unwrap();

        (capture, producers, wait)
    }

    fn push(producer: &MemoryProducer, ts: u64, payload: &[u8]) {
        producer.write(&encode_event(ts, 9, 1, payload)).unwrap();
    }

    fn payload_of(next: NextEvent<'_>) -> Option<Vec<u8>> {
        match next {
            NextEvent::Event { event, .. } => Some(event.payload().to_vec()),
            _ => None,
        }
    }

    fn offline(bootstrap: &Bootstrap, events: &[(u16, Vec<u8>)]) -> Capture {
        let mut dumper = Dumper::new(Vec::new(), bootstrap).unwrap();
        for (cpu, record) in events {
            dumper
                .dump(*cpu, &Event::parse(record).unwrap())
                .unwrap();
        }
        let bytes = dumper.into_inner().unwrap();
        Capture::offline_from_reader(Box::new(Cursor::new(bytes))).unwrap()
    }

    #[test]
    fn test_live_scenario() {
        let (mut capture, producers, _) = open_memory(3);
        push(&producers[0], 10, b"A");
        push(&producers[0], 30, b"C");
        push(&producers[1], 20, b"B");

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(payload_of(capture.next().unwrap()).unwrap());
        }
        assert_eq!(seen, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
        assert!(matches!(capture.next().unwrap(), NextEvent::Timeout));
        assert_eq!(capture.event_count(), 3);
        assert_eq!(capture.mode(), Mode::Live);
        assert_eq!(capture.ndevs(), 3);
    }

    #[test]
    fn test_open_resets_dropping_mode_once() {
        let (_capture, producers, _) = open_memory(3);
        assert_eq!(producers[0].requests(), vec![ControlRequest::DisableDropping]);
        assert!(producers[1].requests().is_empty());
        assert!(producers[2].requests().is_empty());
    }

    #[test]
    fn test_stop_capture_disables_waiting() {
        let (mut capture, producers, wait) = open_memory(2);
        capture.start_capture().unwrap();
        assert!(matches!(capture.next().unwrap(), NextEvent::Timeout));
        assert_eq!(wait.count(), 1);

        capture.stop_capture().unwrap();
        assert_eq!(capture.empty_buffer_timeout(), Duration::ZERO);
        assert!(matches!(capture.next().unwrap(), NextEvent::Timeout));
        assert_eq!(wait.count(), 1);

        for producer in &producers {
            let requests = producer.requests();
            assert!(requests.contains(&ControlRequest::EnableCapture));
            assert!(requests.contains(&ControlRequest::DisableCapture));
        }
    }

    #[test]
    fn test_device_zero_controls() {
        let (mut capture, producers, _) = open_memory(2);
        capture.start_dropping_mode(8).unwrap();
        capture.set_snaplen(256).unwrap();
        capture.stop_dropping_mode().unwrap();

        assert_eq!(
            producers[0].requests(),
            vec![
                ControlRequest::DisableDropping,
                ControlRequest::EnableDropping { sampling_ratio: 8 },
                ControlRequest::SetSnaplen(256),
                ControlRequest::DisableDropping,
            ]
        );
        assert!(producers[1].requests().is_empty());
    }

    #[test]
    fn test_failed_control_is_recorded() {
        let (mut capture, producers, _) = open_memory(3);
        assert_eq!(capture.last_error(), "");

        producers[1].fail_requests(true);
        assert!(matches!(
            capture.stop_capture(),
            Err(CaptureError::Control { device: 1, .. })
        ));
        assert!(capture
            .last_error()
            .starts_with("stop capture failed for device 1"));
        // the timeout is left alone when the stop did not go through
        assert_eq!(capture.empty_buffer_timeout(), Duration::from_millis(30));
    }

    #[test]
    fn test_stats_sum_devices() {
        let (capture, producers, _) = open_memory(2);
        producers[0].set_counters(RingCounters {
            n_evts: 100,
            n_drops_buffer: 2,
            n_drops_pf: 1,
            n_preemptions: 4,
            n_context_switches: 9,
        });
        producers[1].set_counters(RingCounters {
            n_evts: 50,
            n_drops_buffer: 3,
            ..Default::default()
        });

        assert_eq!(
            capture.get_stats(),
            CaptureStats {
                n_evts: 150,
                n_drops: 6,
                n_preemptions: 4,
            }
        );
    }

    #[test]
    fn test_corruption_is_recorded() {
        let (mut capture, producers, _) = open_memory(1);
        producers[0].set_head(9000);

        let err = capture.next().unwrap_err();
        assert!(err.is_corruption());
        assert!(capture.last_error().contains("buffer corruption"));
        assert_eq!(capture.event_count(), 0);
    }

    #[test]
    fn test_offline_replay() {
        let records = vec![
            (2, encode_event(5, 1, 1, b"first")),
            (0, encode_event(3, 1, 1, b"second")),
        ];
        let mut capture = offline(&Bootstrap::default(), &records);

        assert_eq!(capture.mode(), Mode::Offline);
        assert_eq!(capture.ndevs(), 0);
        assert!(capture.machine_info().is_none());

        match capture.next().unwrap() {
            NextEvent::Event { device, event } => {
                assert_eq!(device, 2);
                assert_eq!(event.payload(), b"first");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(payload_of(capture.next().unwrap()).unwrap(), b"second");
        assert!(matches!(capture.next().unwrap(), NextEvent::Eof));
        assert!(matches!(capture.next().unwrap(), NextEvent::Eof));
        assert_eq!(capture.event_count(), 2);
        assert_eq!(capture.get_stats(), CaptureStats::default());
    }

    #[test]
    fn test_offline_controls_are_rejected() {
        let mut capture = offline(&Bootstrap::default(), &[]);
        let timeout = capture.empty_buffer_timeout();

        assert!(matches!(
            capture.start_capture(),
            Err(CaptureError::Unsupported("start capture"))
        ));
        assert!(matches!(
            capture.stop_capture(),
            Err(CaptureError::Unsupported(_))
        ));
        assert_eq!(capture.empty_buffer_timeout(), timeout);
        assert!(capture.start_dropping_mode(2).is_err());
        assert!(capture.stop_dropping_mode().is_err());
        assert!(capture.set_snaplen(64).is_err());
        assert_eq!(
            capture.last_error(),
            "set snaplen not supported on offline captures"
        );
    }

    #[test]
    fn test_offline_bootstrap_and_kernel_thread() {
        let mut bootstrap = Bootstrap::default();
        bootstrap.machine_info = Some(MachineInfo {
            num_cpus: 4,
            memory_size_bytes: 1 << 30,
            hostname: "replay".to_string(),
        });
        bootstrap.processes.insert(ThreadInfo {
            tid: 42,
            pid: 42,
            comm: "sh".to_string(),
            ..Default::default()
        });

        let capture = offline(&bootstrap, &[]);
        assert_eq!(capture.machine_info().unwrap().hostname, "replay");
        assert_eq!(capture.process_table().get(42).unwrap().comm, "sh");
        assert_eq!(capture.kernel_thread().tid, -1);
        assert_eq!(capture.kernel_thread().comm, "kernel");
        assert_eq!(capture.kernel_thread().exe, "kernel");
        assert!(capture.interfaces().addresses.is_empty());
        assert!(capture.users().users.is_empty());
        capture.close();
    }

    #[test]
    fn test_offline_open_errors() {
        assert!(matches!(
            Capture::open_offline(Path::new("/nonexistent/trace.scap")),
            Err(CaptureError::Io(_))
        ));
        assert!(matches!(
            Capture::offline_from_reader(Box::new(Cursor::new(b"garbage!".to_vec()))),
            Err(CaptureError::TraceFile(_))
        ));
    }

    struct Tracked {
        inner: MemoryRingStorage,
        drops: Arc<AtomicUsize>,
        // hide the mirrored half of the data region
        truncated: bool,
    }

    impl Tracked {
        fn new(drops: &Arc<AtomicUsize>) -> Result<Self, StorageError> {
            Ok(Tracked {
                inner: MemoryRingStorage::new(64)?,
                drops: drops.clone(),
                truncated: false,
            })
        }
    }

    impl RingStorage for Tracked {
        fn control_block(&self) -> &RingControlBlock {
            self.inner.control_block()
        }

        fn data(&self) -> &[u8] {
            let data = self.inner.data();
            if self.truncated {
                &data[..self.inner.capacity() as usize]
            } else {
                data
            }
        }

        fn capacity(&self) -> u32 {
            self.inner.capacity()
        }

        fn control(&self, request: ControlRequest) -> io::Result<()> {
            self.inner.control(request)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failed_open_releases_opened_devices() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut opened = 0;

        let result = Capture::open_live_with(
            &LiveConfig::default(),
            4,
            Bootstrap::default(),
            Box::new(RecordingWait::new()),
            |device| {
                if device == 2 {
                    return Err(StorageError::Open {
                        path: "/dev/sysdig2".to_string(),
                        source: io::Error::from(io::ErrorKind::NotFound),
                    });
                }
                opened += 1;
                Ok(Box::new(Tracked::new(&drops)?) as Box<dyn RingStorage>)
            },
        );

        assert!(matches!(result, Err(CaptureError::Setup { device: 2, .. })));
        assert_eq!(opened, 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rejected_storage_releases_opened_devices() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut handed_out = 0;

        let result = Capture::open_live_with(
            &LiveConfig::default(),
            4,
            Bootstrap::default(),
            Box::new(RecordingWait::new()),
            |device| {
                handed_out += 1;
                let mut storage = Tracked::new(&drops)?;
                storage.truncated = device == 2;
                Ok(Box::new(storage) as Box<dyn RingStorage>)
            },
        );

        assert!(matches!(
            result,
            Err(CaptureError::Ring {
                device: 2,
                source: RingError::InvalidStorage {
                    expected: 128,
                    actual: 64
                }
            })
        ));
        assert_eq!(handed_out, 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_dropping_reset_releases_devices() {
        let drops = Arc::new(AtomicUsize::new(0));

        let result = Capture::open_live_with(
            &LiveConfig::default(),
            3,
            Bootstrap::default(),
            Box::new(RecordingWait::new()),
            |_| {
                let storage = Tracked::new(&drops)?;
                storage.inner.producer().fail_requests(true);
                Ok(Box::new(storage) as Box<dyn RingStorage>)
            },
        );

        assert!(matches!(result, Err(CaptureError::Control { device: 0, .. })));
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_close_releases_devices_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let capture = Capture::open_live_with(
            &LiveConfig::default(),
            2,
            Bootstrap::default(),
            Box::new(RecordingWait::new()),
            |_| Ok(Box::new(Tracked::new(&drops)?) as Box<dyn RingStorage>),
        )
        .unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        capture.close();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_device_count() {
        let result = Capture::open_live_with(
            &LiveConfig::default(),
            0,
            Bootstrap::default(),
            Box::new(RecordingWait::new()),
            |_| unreachable!(),
        );
        assert!(matches!(result, Err(CaptureError::InvalidDeviceCount(0))));
    }

    #[test]
    fn test_os_platform() {
        let (capture, _, _) = open_memory(1);
        if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            assert_eq!(capture.os_platform(), OsPlatform::LinuxX64);
        }
    }
}
