use ppm_ring::RingCounters;

/// Aggregate producer statistics of a capture
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Events written by the producer
    pub n_evts: u64,
    /// Events lost because a ring was full or a page fault hit
    pub n_drops: u64,
    /// Events interrupted by preemption
    pub n_preemptions: u64,
}

impl CaptureStats {
    /// Sums the counters of every device
    pub fn from_counters<I>(counters: I) -> Self
    where
        I: IntoIterator<Item = RingCounters>,
    {
        counters
            .into_iter()
            .fold(CaptureStats::default(), |mut stats, c| {
                stats.n_evts += c.n_evts;
                stats.n_drops += c.n_drops_buffer + c.n_drops_pf;
                stats.n_preemptions += c.n_preemptions;
                stats
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sums_devices() {
        let counters = [
            RingCounters {
                n_evts: 10,
                n_drops_buffer: 1,
                n_drops_pf: 2,
                n_preemptions: 3,
                n_context_switches: 100,
            },
            RingCounters {
                n_evts: 5,
                n_drops_buffer: 4,
                n_drops_pf: 0,
                n_preemptions: 1,
                n_context_switches: 7,
            },
        ];

        assert_eq!(
            CaptureStats::from_counters(counters),
            CaptureStats {
                n_evts: 15,
                n_drops: 7,
                n_preemptions: 4,
            }
        );
    }

    #[test]
    fn test_no_devices() {
        assert_eq!(
            CaptureStats::from_counters(Vec::new()),
            CaptureStats::default()
        );
    }
}
