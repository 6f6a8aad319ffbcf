//! Run context (`Cx`) for the replication engine.
//!
//! Every long-running loop in the engine takes an explicit `&Cx` instead of
//! consulting globals: cancellation flags, shutdown fuses and poll timings
//! all live here. Reader threads poll it between I/O calls, the parser
//! thread polls it at every loop boundary and after every `parse()` step.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Fuse counters are disarmed with this sentinel.
const FUSE_DISARMED: i64 = -1;

/// Poll timings for the orchestration loops, in microseconds.
///
/// These mirror the config knobs of the same names; the defaults match a
/// lightly loaded single-instance database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimings {
    /// Sleep between main-loop passes when no redo was processed.
    pub refresh_interval_us: u64,
    /// Sleep while waiting for new data in an online redo log.
    pub redo_read_sleep_us: u64,
    /// Sleep between retries of a not-yet-archived redo log.
    pub arch_read_sleep_us: u64,
    /// Number of open retries for a not-yet-archived redo log.
    pub arch_read_tries: u32,
}

impl Default for PollTimings {
    fn default() -> Self {
        Self {
            refresh_interval_us: 10_000_000,
            redo_read_sleep_us: 50_000,
            arch_read_sleep_us: 10_000_000,
            arch_read_tries: 10,
        }
    }
}

/// Shared run context: cancellation, shutdown fuses, poll timings.
///
/// Cheap to share behind an `Arc`. All flag operations are monotone: once
/// a shutdown is requested it can only escalate, never clear.
#[derive(Debug)]
pub struct Cx {
    soft_shutdown: AtomicBool,
    hard_shutdown: AtomicBool,
    /// Stop after this many log switches (test/debug fuse).
    stop_log_switches: AtomicI64,
    /// Stop after this many emitted transactions (test/debug fuse).
    stop_transactions: AtomicI64,
    pub timings: PollTimings,
}

impl Cx {
    #[must_use]
    pub fn new(timings: PollTimings) -> Self {
        Self {
            soft_shutdown: AtomicBool::new(false),
            hard_shutdown: AtomicBool::new(false),
            stop_log_switches: AtomicI64::new(FUSE_DISARMED),
            stop_transactions: AtomicI64::new(FUSE_DISARMED),
            timings,
        }
    }

    /// Request a soft shutdown: loops finish their current unit of work
    /// (an LWN group, an archive file) and drain pending state.
    pub fn stop_soft(&self) {
        self.soft_shutdown.store(true, Ordering::SeqCst);
    }

    /// Request a hard stop: in-flight I/O finishes, deferral is bypassed.
    pub fn stop_hard(&self) {
        self.soft_shutdown.store(true, Ordering::SeqCst);
        self.hard_shutdown.store(true, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn is_soft_shutdown(&self) -> bool {
        self.soft_shutdown.load(Ordering::SeqCst)
    }

    #[inline]
    #[must_use]
    pub fn is_hard_shutdown(&self) -> bool {
        self.hard_shutdown.load(Ordering::SeqCst)
    }

    /// Arm the log-switch fuse: soft-stop after `count` log switches.
    pub fn arm_stop_log_switches(&self, count: u32) {
        self.stop_log_switches
            .store(i64::from(count), Ordering::SeqCst);
    }

    /// Arm the transaction fuse: soft-stop after `count` emitted transactions.
    pub fn arm_stop_transactions(&self, count: u32) {
        self.stop_transactions
            .store(i64::from(count), Ordering::SeqCst);
    }

    /// Record one log switch. Returns true when the fuse just burned out;
    /// the caller is expected to initiate the soft shutdown.
    #[must_use]
    pub fn tick_log_switch(&self) -> bool {
        Self::tick(&self.stop_log_switches)
    }

    /// Record one emitted transaction. Returns true when the fuse just
    /// burned out.
    #[must_use]
    pub fn tick_transaction(&self) -> bool {
        Self::tick(&self.stop_transactions)
    }

    fn tick(fuse: &AtomicI64) -> bool {
        let mut current = fuse.load(Ordering::SeqCst);
        loop {
            if current <= 0 {
                // Disarmed, or already burned out.
                return false;
            }
            match fuse.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return current == 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// Sleep for `micros`, waking early on soft shutdown.
    ///
    /// Sleeps in 10 ms slices so a shutdown request is observed promptly.
    pub fn sleep_us(&self, micros: u64) {
        const SLICE_US: u64 = 10_000;
        let mut remaining = micros;
        while remaining > 0 && !self.is_soft_shutdown() {
            let step = remaining.min(SLICE_US);
            std::thread::sleep(Duration::from_micros(step));
            remaining -= step;
        }
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new(PollTimings::default())
    }
}
