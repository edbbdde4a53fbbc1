use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use meridian_common::error::TxnError;

const CODE_NONE: u8 = 0;
const CODE_DEADLINE: u8 = 1;
const CODE_INTERRUPTED: u8 = 2;
const CODE_CLOSED: u8 = 3;

/// Reports the elapsed runtime of an aborted attempt and re-acquires a
/// permit; returns false when the scheduler is gone and the scan cannot
/// continue.
pub(crate) type RetryHook = Box<dyn Fn(Duration) -> bool + Send + Sync>;

/// Scan-only extension of a [`TxnStatus`]: when the scan started, the
/// scheduler's shared interrupt flag, and the hook that reports the elapsed
/// runtime and re-acquires a permit on retry.
pub(crate) struct ScanState {
    pub(crate) started_at: Mutex<Instant>,
    pub(crate) interrupted: Arc<AtomicBool>,
    pub(crate) on_retry: RetryHook,
}

/// Per-operation cancellation status. The sole channel through which a
/// running operation learns it must stop: an absolute wall-clock deadline,
/// and (for scans) the scheduler's interrupt signal.
///
/// The abort code is computed lazily in [`is_aborted`](Self::is_aborted) /
/// [`error`](Self::error) and is sticky once set — a scan that observes
/// `Interrupted` keeps observing it until it calls [`retry`](Self::retry).
/// The check is two atomic loads and a clock read, cheap enough for the hot
/// loop of a spatial scan.
pub struct TxnStatus {
    deadline: Option<SystemTime>,
    code: AtomicU8,
    scan: Option<Arc<ScanState>>,
}

impl Clone for TxnStatus {
    /// A clone shares the scan state (and thus the interrupt flag and retry
    /// hook) and carries the abort code as of now; subsequent sticky codes
    /// are per-view, matching [`with_deadline`](Self::with_deadline).
    fn clone(&self) -> Self {
        Self {
            deadline: self.deadline,
            code: AtomicU8::new(self.code.load(Ordering::Acquire)),
            scan: self.scan.clone(),
        }
    }
}

impl TxnStatus {
    /// A status with no deadline and no scan state. Never aborts.
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            code: AtomicU8::new(CODE_NONE),
            scan: None,
        }
    }

    pub(crate) fn for_scan(scan: Arc<ScanState>) -> Self {
        Self {
            deadline: None,
            code: AtomicU8::new(CODE_NONE),
            scan: Some(scan),
        }
    }

    /// True once the operation should stop at its next safe point.
    pub fn is_aborted(&self) -> bool {
        self.update_if_needed();
        self.code.load(Ordering::Acquire) != CODE_NONE
    }

    /// The sticky abort reason, if any.
    pub fn error(&self) -> Option<TxnError> {
        self.update_if_needed();
        match self.code.load(Ordering::Acquire) {
            CODE_DEADLINE => Some(TxnError::DeadlineExceeded),
            CODE_INTERRUPTED => Some(TxnError::Interrupted),
            CODE_CLOSED => Some(TxnError::Closed),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    /// A view of this status with the tighter of the existing and the given
    /// deadline. Scan state is shared with the original; the abort code is
    /// carried over as of now.
    pub fn with_deadline(&self, deadline: SystemTime) -> TxnStatus {
        let tighter = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        TxnStatus {
            deadline: Some(tighter),
            code: AtomicU8::new(self.code.load(Ordering::Acquire)),
            scan: self.scan.clone(),
        }
    }

    /// Resume after an interruption: report the elapsed runtime to the
    /// scheduler (which blocks until a fresh permit is granted), then clear
    /// the sticky code and restart the scan clock. Only meaningful when the
    /// current error is `Interrupted`; a no-op on non-scan statuses. When
    /// the scheduler has shut down the status becomes `Closed` instead.
    pub fn retry(&self) {
        let Some(scan) = &self.scan else { return };
        let elapsed = scan.started_at.lock().elapsed();
        if !(scan.on_retry)(elapsed) {
            self.code.store(CODE_CLOSED, Ordering::Release);
            return;
        }
        self.code.store(CODE_NONE, Ordering::Release);
        *scan.started_at.lock() = Instant::now();
    }

    fn update_if_needed(&self) {
        if self.code.load(Ordering::Acquire) != CODE_NONE {
            return;
        }
        if let Some(deadline) = self.deadline {
            if SystemTime::now() >= deadline {
                self.code.store(CODE_DEADLINE, Ordering::Release);
                return;
            }
        }
        if let Some(scan) = &self.scan {
            if scan.interrupted.load(Ordering::Acquire) {
                self.code.store(CODE_INTERRUPTED, Ordering::Release);
            }
        }
    }
}
