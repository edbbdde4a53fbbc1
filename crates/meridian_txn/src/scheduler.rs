//! Read/write/scan concurrency scheduler.
//!
//! A single coordinator thread owns the phase machine
//! `ReadPhase → PrepareWrite → DrainReaders → WritePhase → PrepareRead` and
//! is the only mutator of its state. Workers rendezvous with it over
//! zero-capacity channels: a request send blocks until the coordinator picks
//! it up, a permit receive blocks until the coordinator grants it.
//!
//! Reads and scans run concurrently with each other during a read phase.
//! When a write arrives, the coordinator waits up to the adaptive write
//! delay for in-flight operations to drain, then raises the shared interrupt
//! flag; scans observe it through their [`TxnStatus`] at the next item
//! boundary, unwind, and report their elapsed runtime. The delay adapts so
//! that scans which keep getting cut short earn a longer grace period, and
//! quiet periods decay it back down.
//!
//! An operation that never signals completion wedges the scheduler — permits
//! are guard objects that signal on `done()` or on drop, so every exit path
//! releases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use meridian_common::error::TxnError;

use crate::stats::SchedulerStats;
use crate::status::{ScanState, TxnStatus};

/// Write delay bounds for the adaptive clamp.
const MIN_WRITE_DELAY: Duration = Duration::from_millis(1);
const MAX_WRITE_DELAY: Duration = Duration::from_secs(60);

/// Completion report sent by a finishing operation. `None` means the
/// operation ran to completion; `Some(elapsed)` means a scan aborted
/// mid-flight after running for `elapsed`.
type Completion = Option<Duration>;

pub struct Scheduler {
    read_requests: Sender<()>,
    write_requests: Sender<()>,
    read_permits: Receiver<()>,
    write_permits: Receiver<()>,
    op_complete: Sender<Completion>,
    interrupt: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

/// Stops the coordinator thread. Dropping the handle also stops it.
pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the coordinator's stop channel.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler {
    pub fn new(
        initial_write_delay: Duration,
        max_read_delay: Duration,
    ) -> (Arc<Scheduler>, SchedulerHandle) {
        let (read_req_tx, read_req_rx) = bounded::<()>(0);
        let (write_req_tx, write_req_rx) = bounded::<()>(0);
        let (read_permit_tx, read_permit_rx) = bounded::<()>(0);
        let (write_permit_tx, write_permit_rx) = bounded::<()>(0);
        let (complete_tx, complete_rx) = bounded::<Completion>(0);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let stats = Arc::new(SchedulerStats::default());
        stats
            .current_write_delay_ns
            .store(initial_write_delay.as_nanos() as u64, Ordering::Relaxed);

        let scheduler = Arc::new(Scheduler {
            read_requests: read_req_tx,
            write_requests: write_req_tx,
            read_permits: read_permit_rx,
            write_permits: write_permit_rx,
            op_complete: complete_tx,
            interrupt: Arc::new(AtomicBool::new(false)),
            stats: stats.clone(),
        });

        let coordinator = Coordinator {
            read_requests: read_req_rx,
            write_requests: write_req_rx,
            read_permits: read_permit_tx,
            write_permits: write_permit_tx,
            op_complete: complete_rx,
            stop: stop_rx,
            interrupt: scheduler.interrupt.clone(),
            stats,
        };
        let thread = std::thread::Builder::new()
            .name("meridian-scheduler".into())
            .spawn(move || coordinator.run(initial_write_delay, max_read_delay))
            .expect("spawn scheduler thread");

        (
            scheduler,
            SchedulerHandle {
                stop: Some(stop_tx),
                thread: Some(thread),
            },
        )
    }

    /// Block until a read permit is granted.
    pub fn read(&self) -> Result<ReadPermit, TxnError> {
        self.stats.requested_reads.fetch_add(1, Ordering::Relaxed);
        self.acquire_read_slot()?;
        Ok(ReadPermit(CompletionGuard::new(self, OpClass::Read)))
    }

    /// Block until a write permit is granted. The coordinator services
    /// nothing else until the permit completes.
    pub fn write(&self) -> Result<WritePermit, TxnError> {
        self.stats.requested_writes.fetch_add(1, Ordering::Relaxed);
        self.write_requests.send(()).map_err(|_| TxnError::Closed)?;
        self.write_permits.recv().map_err(|_| TxnError::Closed)?;
        Ok(WritePermit(CompletionGuard::new(self, OpClass::Write)))
    }

    /// Block until a scan permit is granted. The returned status shares the
    /// scheduler's interrupt flag; its retry hook reports the elapsed
    /// runtime and blocks until a fresh permit is granted.
    pub fn scan(&self) -> Result<(ScanPermit, TxnStatus), TxnError> {
        self.stats.requested_scans.fetch_add(1, Ordering::Relaxed);
        self.acquire_read_slot()?;

        let op_complete = self.op_complete.clone();
        let read_requests = self.read_requests.clone();
        let read_permits = self.read_permits.clone();
        let status = TxnStatus::for_scan(Arc::new(ScanState {
            started_at: Mutex::new(Instant::now()),
            interrupted: self.interrupt.clone(),
            on_retry: Box::new(move |elapsed| {
                // Report the aborted attempt, then rejoin the read queue.
                // Both sends block until the coordinator is ready for them.
                if op_complete.send(Some(elapsed)).is_err() {
                    return false;
                }
                if read_requests.send(()).is_err() {
                    return false;
                }
                read_permits.recv().is_ok()
            }),
        }));
        Ok((ScanPermit(CompletionGuard::new(self, OpClass::Scan)), status))
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    fn acquire_read_slot(&self) -> Result<(), TxnError> {
        self.read_requests.send(()).map_err(|_| TxnError::Closed)?;
        self.read_permits.recv().map_err(|_| TxnError::Closed)
    }
}

#[derive(Clone, Copy, Debug)]
enum OpClass {
    Read,
    Write,
    Scan,
}

/// Signals operation completion exactly once: either through an explicit
/// `done()` or, failing that, on drop.
#[derive(Debug)]
struct CompletionGuard {
    op_complete: Sender<Completion>,
    stats: Arc<SchedulerStats>,
    class: OpClass,
    released: bool,
}

impl CompletionGuard {
    fn new(scheduler: &Scheduler, class: OpClass) -> Self {
        Self {
            op_complete: scheduler.op_complete.clone(),
            stats: scheduler.stats.clone(),
            class,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let counter = match self.class {
            OpClass::Read => &self.stats.completed_reads,
            OpClass::Write => &self.stats.completed_writes,
            OpClass::Scan => &self.stats.completed_scans,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let _ = self.op_complete.send(None);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
pub struct ReadPermit(CompletionGuard);
#[derive(Debug)]
pub struct WritePermit(CompletionGuard);
#[derive(Debug)]
pub struct ScanPermit(CompletionGuard);

impl ReadPermit {
    pub fn done(mut self) {
        self.0.release();
    }
}

impl WritePermit {
    pub fn done(mut self) {
        self.0.release();
    }
}

impl ScanPermit {
    pub fn done(mut self) {
        self.0.release();
    }
}

struct Coordinator {
    read_requests: Receiver<()>,
    write_requests: Receiver<()>,
    read_permits: Sender<()>,
    write_permits: Sender<()>,
    op_complete: Receiver<Completion>,
    stop: Receiver<()>,
    interrupt: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl Coordinator {
    fn run(self, initial_write_delay: Duration, max_read_delay: Duration) {
        let mut inflight: usize = 0;
        let mut write_delay = initial_write_delay;
        let mut max_write_delay = initial_write_delay;

        'scheduler: loop {
            // Read phase: grant every read/scan immediately, until a write
            // request arrives.
            let interrupt_timer;
            loop {
                select! {
                    recv(self.read_requests) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        inflight += 1;
                        if self.read_permits.send(()).is_err() {
                            break 'scheduler;
                        }
                    }
                    recv(self.op_complete) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        inflight -= 1;
                    }
                    recv(self.write_requests) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        interrupt_timer = after(write_delay);
                        break;
                    }
                    recv(self.stop) -> _ => break 'scheduler,
                }
            }

            // Prepare-write phase: keep granting reads while waiting for the
            // in-flight count to reach zero or the interrupt timer to fire.
            let mut timed_out = false;
            while inflight > 0 && !timed_out {
                select! {
                    recv(self.read_requests) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        inflight += 1;
                        if self.read_permits.send(()).is_err() {
                            break 'scheduler;
                        }
                    }
                    recv(self.op_complete) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        inflight -= 1;
                    }
                    recv(interrupt_timer) -> _ => timed_out = true,
                    recv(self.stop) -> _ => break 'scheduler,
                }
            }

            // Drain-readers phase: signal the interrupt and wait for every
            // remaining operation. Each completion reports whether it was
            // cut short (`Some(elapsed)`) or finished normally (`None`).
            let mut max_runtime: Option<Duration> = None;
            let mut interrupted_runtime = Duration::ZERO;
            let mut interruptions: u64 = 0;
            self.interrupt.store(true, Ordering::Release);
            while inflight > 0 {
                select! {
                    recv(self.op_complete) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        inflight -= 1;
                        if let Ok(Some(runtime)) = msg {
                            if max_runtime.map_or(true, |m| runtime > m) {
                                max_runtime = Some(runtime);
                            }
                            interruptions += 1;
                            interrupted_runtime += runtime;
                        }
                    }
                    recv(self.stop) -> _ => break 'scheduler,
                }
            }
            self.interrupt.store(false, Ordering::Release);

            // Adapt the write delay. A scan that ran past the current delay
            // before being interrupted earns double its runtime; a fully
            // clean drain decays the delay by a quarter. The in-between case
            // leaves the delay unchanged.
            match max_runtime {
                Some(runtime) if runtime > write_delay => write_delay = runtime * 2,
                None => write_delay = write_delay / 4 * 3,
                _ => {}
            }
            write_delay = write_delay.clamp(MIN_WRITE_DELAY, MAX_WRITE_DELAY);

            self.stats
                .scan_interruptions
                .fetch_add(interruptions, Ordering::Relaxed);
            self.stats
                .partial_completion_scan_ns
                .fetch_add(interrupted_runtime.as_nanos() as u64, Ordering::Relaxed);
            self.stats
                .current_write_delay_ns
                .store(write_delay.as_nanos() as u64, Ordering::Relaxed);
            if write_delay > max_write_delay {
                max_write_delay = write_delay;
                self.stats
                    .max_write_delay_ns
                    .store(write_delay.as_nanos() as u64, Ordering::Relaxed);
            }

            // Write phase: grant the write that started this cycle, then
            // further writes one at a time, each blocking the coordinator
            // until its completion arrives.
            if !self.grant_write() {
                break 'scheduler;
            }
            let read_timer;
            loop {
                select! {
                    recv(self.read_requests) -> msg => {
                        if msg.is_err() {
                            break 'scheduler;
                        }
                        read_timer = after(max_read_delay);
                        break;
                    }
                    recv(self.write_requests) -> _ => {
                        if !self.grant_write() {
                            break 'scheduler;
                        }
                    }
                    recv(self.stop) -> _ => break 'scheduler,
                }
            }

            // Prepare-read phase: drain immediately-pending writes without
            // blocking, until none remain or the read timer expires.
            loop {
                if read_timer.try_recv().is_ok() {
                    break;
                }
                match self.write_requests.try_recv() {
                    Ok(()) => {
                        if !self.grant_write() {
                            break 'scheduler;
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            // Grant the read that ended the write phase and start over.
            inflight += 1;
            if self.read_permits.send(()).is_err() {
                break 'scheduler;
            }
        }

        // Drain stragglers so blocked completion sends can finish.
        self.interrupt.store(true, Ordering::Release);
        while inflight > 0 {
            if self.op_complete.recv().is_err() {
                break;
            }
            inflight -= 1;
        }
    }

    /// Grant one write permit and block until its completion report.
    fn grant_write(&self) -> bool {
        if self.write_permits.send(()).is_err() {
            return false;
        }
        self.op_complete.recv().is_ok()
    }
}
