use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Scheduler counters. Written with atomic add/store on the scheduling and
/// completion paths, read only by the metrics surface — never on the hot
/// path.
#[derive(Default, Debug)]
pub struct SchedulerStats {
    /// Current write delay period, in nanoseconds.
    pub(crate) current_write_delay_ns: AtomicU64,
    /// Maximum write delay seen by this scheduler so far, in nanoseconds.
    pub(crate) max_write_delay_ns: AtomicU64,
    /// Time spent on scan attempts that ended up interrupted, in nanoseconds.
    pub(crate) partial_completion_scan_ns: AtomicU64,
    /// Number of scan interruptions.
    pub(crate) scan_interruptions: AtomicU64,

    pub(crate) requested_writes: AtomicU64,
    pub(crate) requested_reads: AtomicU64,
    pub(crate) requested_scans: AtomicU64,
    pub(crate) completed_writes: AtomicU64,
    pub(crate) completed_reads: AtomicU64,
    pub(crate) completed_scans: AtomicU64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            current_write_delay: Duration::from_nanos(
                self.current_write_delay_ns.load(Ordering::Relaxed),
            ),
            max_write_delay: Duration::from_nanos(self.max_write_delay_ns.load(Ordering::Relaxed)),
            partial_completion_scan_time: Duration::from_nanos(
                self.partial_completion_scan_ns.load(Ordering::Relaxed),
            ),
            scan_interruptions: self.scan_interruptions.load(Ordering::Relaxed),
            requested_writes: self.requested_writes.load(Ordering::Relaxed),
            requested_reads: self.requested_reads.load(Ordering::Relaxed),
            requested_scans: self.requested_scans.load(Ordering::Relaxed),
            completed_writes: self.completed_writes.load(Ordering::Relaxed),
            completed_reads: self.completed_reads.load(Ordering::Relaxed),
            completed_scans: self.completed_scans.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStatsSnapshot {
    pub current_write_delay: Duration,
    pub max_write_delay: Duration,
    pub partial_completion_scan_time: Duration,
    pub scan_interruptions: u64,
    pub requested_writes: u64,
    pub requested_reads: u64,
    pub requested_scans: u64,
    pub completed_writes: u64,
    pub completed_reads: u64,
    pub completed_scans: u64,
}

impl SchedulerStatsSnapshot {
    pub fn current_write_delay_seconds(&self) -> f64 {
        self.current_write_delay.as_secs_f64()
    }

    pub fn max_write_delay_seconds(&self) -> f64 {
        self.max_write_delay.as_secs_f64()
    }

    pub fn partial_completion_scan_seconds(&self) -> f64 {
        self.partial_completion_scan_time.as_secs_f64()
    }
}
