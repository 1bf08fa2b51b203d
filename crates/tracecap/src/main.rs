use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capture::{Capture, CaptureStats, LiveConfig, Mode, NextEvent};
use clap::Parser;
use time::macros::format_description;
use time::OffsetDateTime;
use tracefile::Dumper;

/// Kernel event capture tool
#[derive(Debug, Parser)]
struct Command {
    /// Replay a trace file instead of capturing live
    #[arg(short, long)]
    read: Option<PathBuf>,

    /// Write captured events to a trace file
    #[arg(short, long)]
    write: Option<PathBuf>,

    /// Stop after this many events (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Capture duration in seconds (0 = unlimited)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Maximum payload bytes captured per event
    #[arg(short, long)]
    snaplen: Option<u32>,

    /// Keep one event in N in the driver
    #[arg(long)]
    sampling_ratio: Option<u32>,

    /// Prefix of the per-CPU device nodes
    #[arg(long, default_value = "/dev/sysdig")]
    device_prefix: String,

    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,
}

/// When to stop reading events
struct Limits {
    count: Option<u64>,
    deadline: Option<Instant>,
}

impl Limits {
    fn new(count: u64, duration: u64, start: Instant) -> Self {
        Limits {
            count: (count > 0).then_some(count),
            deadline: (duration > 0).then(|| start + Duration::from_secs(duration)),
        }
    }

    fn reached(&self, events: u64, now: Instant) -> bool {
        self.count.map_or(false, |max| events >= max)
            || self.deadline.map_or(false, |deadline| now >= deadline)
    }
}

fn format_time() -> String {
    if let Ok(now) = OffsetDateTime::now_local() {
        let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
        now.format(&format)
            .unwrap_or_else(|_| "00:00:00.000".to_string())
    } else {
        "00:00:00.000".to_string()
    }
}

#[cfg(target_os = "linux")]
fn open_live(opts: &Command) -> Result<Capture> {
    let config = LiveConfig {
        device_prefix: opts.device_prefix.clone(),
        ..Default::default()
    };
    let mut capture = Capture::open_live(&config).context("failed to open the capture devices")?;

    if let Some(snaplen) = opts.snaplen {
        capture.set_snaplen(snaplen)?;
    }
    if let Some(ratio) = opts.sampling_ratio {
        capture.start_dropping_mode(ratio)?;
    }
    capture.start_capture()?;
    Ok(capture)
}

#[cfg(not(target_os = "linux"))]
fn open_live(_opts: &Command) -> Result<Capture> {
    anyhow::bail!("live capture is only supported on Linux")
}

/// Reads events until the source runs dry or `limits` is reached
///
/// Returns false once an offline source hit end of file.
fn pump(
    capture: &mut Capture,
    dumper: &mut Option<Dumper<std::io::BufWriter<std::fs::File>>>,
    limits: &Limits,
    stop_on_timeout: bool,
) -> Result<bool> {
    loop {
        if limits.reached(capture.event_count(), Instant::now()) {
            return Ok(true);
        }

        match capture.next()? {
            NextEvent::Event { device, event } => {
                log::trace!(
                    "dev={} ts={} tid={} type={} len={}",
                    device,
                    event.ts(),
                    event.tid(),
                    event.event_type(),
                    event.len()
                );
                if let Some(dumper) = dumper.as_mut() {
                    dumper.dump(device, &event)?;
                }
            }
            NextEvent::Timeout if stop_on_timeout => return Ok(true),
            NextEvent::Timeout => {}
            NextEvent::Eof => return Ok(false),
        }
    }
}

fn print_summary(capture: &Capture, stats: CaptureStats, written: Option<u64>, elapsed: Duration) {
    println!("{}", "-".repeat(60));
    println!(
        "{} CAPTURE_COMPLETE: mode={:?} events={} elapsed={:.3}s",
        format_time(),
        capture.mode(),
        capture.event_count(),
        elapsed.as_secs_f64()
    );
    if capture.mode() == Mode::Live {
        println!(
            "  driver: n_evts={} n_drops={} n_preemptions={}",
            stats.n_evts, stats.n_drops, stats.n_preemptions
        );
    }
    if let Some(bytes) = written {
        println!("  dump: {} bytes written", bytes);
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let default_filter = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut capture = match &opts.read {
        Some(path) => Capture::open_offline(path)
            .with_context(|| format!("failed to open trace file {}", path.display()))?,
        None => open_live(&opts)?,
    };

    if let Some(info) = capture.machine_info() {
        log::info!(
            "capturing on {} ({} cpus, {} MiB)",
            info.hostname,
            info.num_cpus,
            info.memory_size_bytes >> 20
        );
    }

    let mut dumper = match &opts.write {
        Some(path) => Some(
            Dumper::create(path, capture.bootstrap())
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => None,
    };

    println!(
        "{} Successfully started! {} threads known, reading events...",
        format_time(),
        capture.process_table().len()
    );

    let start = Instant::now();
    let limits = Limits::new(opts.count, opts.duration, start);
    let more = pump(&mut capture, &mut dumper, &limits, false)
        .with_context(|| format!("capture failed: {}", capture.last_error()))?;

    if more && capture.mode() == Mode::Live {
        // Drain what the driver produced before it was stopped.
        capture.stop_capture()?;
        pump(&mut capture, &mut dumper, &limits, true)?;
    }

    let stats = capture.get_stats();
    let written = match dumper.take() {
        Some(mut dumper) => {
            dumper.flush()?;
            Some(dumper.written_bytes())
        }
        None => None,
    };

    print_summary(&capture, stats, written, start.elapsed());
    capture.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited() {
        let start = Instant::now();
        let limits = Limits::new(0, 0, start);
        assert!(!limits.reached(u64::MAX, start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_count_limit() {
        let start = Instant::now();
        let limits = Limits::new(10, 0, start);
        assert!(!limits.reached(9, start));
        assert!(limits.reached(10, start));
    }

    #[test]
    fn test_duration_limit() {
        let start = Instant::now();
        let limits = Limits::new(0, 2, start);
        assert!(!limits.reached(0, start + Duration::from_secs(1)));
        assert!(limits.reached(0, start + Duration::from_secs(2)));
    }

    #[test]
    fn test_parse_arguments() {
        let opts = Command::parse_from([
            "tracecap",
            "--read",
            "in.scap",
            "-w",
            "out.scap",
            "-n",
            "100",
            "--sampling-ratio",
            "4",
        ]);
        assert_eq!(opts.read, Some(PathBuf::from("in.scap")));
        assert_eq!(opts.write, Some(PathBuf::from("out.scap")));
        assert_eq!(opts.count, 100);
        assert_eq!(opts.duration, 0);
        assert_eq!(opts.sampling_ratio, Some(4));
        assert_eq!(opts.device_prefix, "/dev/sysdig");
        assert!(!opts.verbose);
    }
}
