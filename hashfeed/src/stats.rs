//! Share and work counters.
//!
//! The same [`ShareCounters`] set is kept globally, per pool, and per device.
//! Counters are plain atomics; readers take a [`CounterSnapshot`] when they
//! need a consistent-looking view for display.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct ShareCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub stale: AtomicU64,
    pub duplicates: AtomicU64,
    pub discarded: AtomicU64,
    pub hw_errors: AtomicU64,
    pub remote_failures: AtomicU64,
    pub get_failures: AtomicU64,
    pub getworks: AtomicU64,
    pub local_work: AtomicU64,
    accepted_diff: Mutex<f64>,
    rejected_diff: Mutex<f64>,
    best_share: Mutex<f64>,
}

impl ShareCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_accepted(&self, difficulty: f64) {
        Self::bump(&self.accepted);
        *self.accepted_diff.lock() += difficulty;
    }

    pub fn add_rejected(&self, difficulty: f64) {
        Self::bump(&self.rejected);
        *self.rejected_diff.lock() += difficulty;
    }

    /// Record a share difficulty; returns true if it is a new best.
    pub fn offer_best(&self, difficulty: f64) -> bool {
        let mut best = self.best_share.lock();
        if difficulty > *best {
            *best = difficulty;
            true
        } else {
            false
        }
    }

    pub fn best_share(&self) -> f64 {
        *self.best_share.lock()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            stale: load(&self.stale),
            duplicates: load(&self.duplicates),
            discarded: load(&self.discarded),
            hw_errors: load(&self.hw_errors),
            remote_failures: load(&self.remote_failures),
            get_failures: load(&self.get_failures),
            getworks: load(&self.getworks),
            local_work: load(&self.local_work),
            accepted_diff: *self.accepted_diff.lock(),
            rejected_diff: *self.rejected_diff.lock(),
            best_share: *self.best_share.lock(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub discarded: u64,
    pub hw_errors: u64,
    pub remote_failures: u64,
    pub get_failures: u64,
    pub getworks: u64,
    pub local_work: u64,
    pub accepted_diff: f64,
    pub rejected_diff: f64,
    pub best_share: f64,
}

/// Process-wide statistics.
#[derive(Debug, Default)]
pub struct MinerStats {
    pub shares: ShareCounters,
    pub found_blocks: AtomicU64,
    pub new_blocks: AtomicU64,
    /// Shares handed to the submission pipeline and not yet finalized.
    pub in_flight: AtomicUsize,
}

impl MinerStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}
