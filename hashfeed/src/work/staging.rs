//! The staging queue: fetched work waiting for a device.
//!
//! Work is keyed by id with a secondary index ordered by staging time.
//! Pops are not FIFO; each consumer gets the best-ranked eligible item for
//! its capability, scanning oldest first so ties go to older work.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Work, WorkIds};
use crate::goal::Algorithm;
use crate::stats::{MinerStats, ShareCounters};
use crate::tracing::prelude::*;

/// Which of spare and surplus rollable work to hand out first when no
/// exact match is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PopPreference {
    #[default]
    RollableOverSpare,
    SpareOverRollable,
}

/// What a device can take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceCapability {
    pub algorithm: Algorithm,
    /// Lowest share difficulty the device can report nonces at.
    pub min_nonce_diff: f64,
    /// Highest share difficulty the device can be set to.
    pub max_nonce_diff: f64,
}

impl DeviceCapability {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            min_nonce_diff: 0.0,
            max_nonce_diff: f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fit {
    /// Device filters above the work's difficulty and would miss shares.
    Mismatch,
    Spare,
    RollableSurplus,
    Exact,
}

impl Fit {
    fn rank(self, preference: PopPreference) -> u8 {
        match (self, preference) {
            (Fit::Mismatch, _) => 1,
            (Fit::Spare, PopPreference::RollableOverSpare) => 2,
            (Fit::RollableSurplus, PopPreference::RollableOverSpare) => 3,
            (Fit::RollableSurplus, PopPreference::SpareOverRollable) => 2,
            (Fit::Spare, PopPreference::SpareOverRollable) => 3,
            (Fit::Exact, _) => 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueCounts {
    pub total: usize,
    pub rollable: usize,
    pub spare: usize,
    /// Consumers blocked in `pop`.
    pub waiting: usize,
    pub target: usize,
}

#[derive(Default)]
struct Inner {
    by_id: BTreeMap<u64, Work>,
    by_time: BTreeSet<(Instant, u64)>,
    rollable: usize,
    spare: usize,
    per_algo: HashMap<Algorithm, usize>,
    /// Rollable items staged per pool, keyed by pool address.
    rollable_sources: HashMap<usize, usize>,
    frozen: bool,
    target: usize,
    target_cap: usize,
    underrun: bool,
    waiting: usize,
}

fn pool_key(work: &Work) -> usize {
    Arc::as_ptr(&work.pool) as usize
}

impl Inner {
    fn insert(&mut self, work: Work) {
        if work.is_rollable() {
            self.rollable += 1;
            *self.rollable_sources.entry(pool_key(&work)).or_default() += 1;
        }
        if work.spare {
            self.spare += 1;
        }
        *self.per_algo.entry(work.algorithm()).or_default() += 1;
        self.by_time.insert((work.staged, work.id()));
        self.by_id.insert(work.id(), work);
    }

    fn remove(&mut self, id: u64) -> Option<Work> {
        let work = self.by_id.remove(&id)?;
        self.by_time.remove(&(work.staged, id));
        if work.is_rollable() {
            self.rollable -= 1;
            let key = pool_key(&work);
            if let Some(n) = self.rollable_sources.get_mut(&key) {
                *n -= 1;
                if *n == 0 {
                    self.rollable_sources.remove(&key);
                }
            }
        }
        if work.spare {
            self.spare -= 1;
        }
        if let Some(n) = self.per_algo.get_mut(&work.algorithm()) {
            *n -= 1;
        }
        Some(work)
    }

    fn fit(&self, work: &Work, cap: &DeviceCapability) -> Option<Fit> {
        if work.algorithm() != cap.algorithm {
            return None;
        }
        let difficulty = work.difficulty.as_f64();
        if difficulty > cap.max_nonce_diff {
            return None;
        }
        if cap.min_nonce_diff > difficulty {
            return Some(Fit::Mismatch);
        }
        if work.spare {
            return Some(Fit::Spare);
        }
        // Keep one rollable item per pool as a clone source
        if work.is_rollable() && self.rollable > self.rollable_sources.len() {
            return Some(Fit::RollableSurplus);
        }
        Some(Fit::Exact)
    }

    fn best(&self, cap: &DeviceCapability, preference: PopPreference) -> Option<u64> {
        let mut best: Option<(u8, u64)> = None;
        for (_, id) in &self.by_time {
            let Some(work) = self.by_id.get(id) else {
                continue;
            };
            let Some(fit) = self.fit(work, cap) else {
                continue;
            };
            let rank = fit.rank(preference);
            if best.is_none_or(|(r, _)| rank > r) {
                best = Some((rank, *id));
            }
            if fit == Fit::Exact {
                break;
            }
        }
        best.map(|(_, id)| id)
    }
}

pub struct StagingQueue {
    inner: Mutex<Inner>,
    /// Signaled when work is staged or the queue freezes.
    available: Notify,
    /// Signaled when the scheduler should fetch more.
    space: Notify,
    ids: Arc<WorkIds>,
    stats: Arc<MinerStats>,
    preference: PopPreference,
}

/// Decrements the waiting count when a pop stops waiting, however it ends.
struct Waiting<'a>(&'a Mutex<Inner>);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.lock().waiting -= 1;
    }
}

impl StagingQueue {
    pub fn new(
        ids: Arc<WorkIds>,
        stats: Arc<MinerStats>,
        target: usize,
        preference: PopPreference,
    ) -> Self {
        let target = target.max(1);
        Self {
            inner: Mutex::new(Inner {
                target,
                target_cap: target * 4,
                ..Inner::default()
            }),
            available: Notify::new(),
            space: Notify::new(),
            ids,
            stats,
            preference,
        }
    }

    /// Add work. Hands the work back if the queue is frozen; the caller
    /// then owns and discards it.
    pub fn stage(&self, work: Work) -> Result<(), Work> {
        {
            let mut inner = self.inner.lock();
            if inner.frozen {
                return Err(work);
            }
            trace!(work_id = work.id(), pool = work.pool.number(), "Staging work.");
            inner.insert(work);
        }
        self.available.notify_waiters();
        Ok(())
    }

    /// Take the best work for `cap`, waiting if none is eligible.
    ///
    /// If the chosen item passes `should_roll`, a clone is returned and the
    /// original is rolled and stays staged. Returns `None` once frozen.
    pub async fn pop<F>(&self, cap: &DeviceCapability, should_roll: F) -> Option<Work>
    where
        F: Fn(&Work) -> bool,
    {
        let mut waiting: Option<Waiting<'_>> = None;
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.frozen {
                    return None;
                }
                if let Some(id) = inner.best(cap, self.preference)
                    && let Some(mut work) = inner.remove(id)
                {
                    inner.underrun = false;
                    if should_roll(&work) {
                        let clone = work.make_clone(&self.ids);
                        work.roll(&self.ids);
                        inner.insert(work);
                        return Some(clone);
                    }
                    drop(inner);
                    drop(waiting);
                    self.space.notify_one();
                    return Some(work);
                }

                if !inner.underrun {
                    inner.underrun = true;
                    if inner.target < inner.target_cap {
                        inner.target += 1;
                        warn!(queue = inner.target, "Work underrun, raising queue depth.");
                    }
                }
                if waiting.is_none() {
                    inner.waiting += 1;
                    waiting = Some(Waiting(&self.inner));
                }
            }

            self.space.notify_one();
            available.await;
        }
    }

    /// Retire work that will not be used, counting it unless it was a clone
    /// or had been rolled.
    pub fn discard(&self, work: Work) {
        if !work.clone && work.rolls == 0 {
            ShareCounters::bump(&self.stats.shares.discarded);
            ShareCounters::bump(&work.pool.stats.discarded);
            debug!(work_id = work.id(), "Discarded work.");
        } else {
            trace!(work_id = work.id(), "Discarded cloned or rolled work.");
        }
    }

    /// Discard staged work matching `pred`. Returns how many were removed.
    pub fn discard_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&Work) -> bool,
    {
        let removed: Vec<Work> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .by_id
                .values()
                .filter(|w| pred(w))
                .map(Work::id)
                .collect();
            ids.into_iter().filter_map(|id| inner.remove(id)).collect()
        };
        let count = removed.len();
        for work in removed {
            self.discard(work);
        }
        if count > 0 {
            self.space.notify_one();
        }
        count
    }

    /// Discard staged work that `is_stale` rejects. Mandatory work is kept.
    pub fn prune_stale<F>(&self, is_stale: F) -> usize
    where
        F: Fn(&Work) -> bool,
    {
        let pruned = self.discard_where(|w| !w.mandatory && is_stale(w));
        if pruned > 0 {
            debug!(pruned, "Discarded stale work.");
        }
        pruned
    }

    /// Refuse new work and release every waiter.
    pub fn freeze(&self) {
        self.inner.lock().frozen = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    /// Wait until fewer than `max_staged` items are staged. Returns false if
    /// the queue froze instead.
    pub async fn wait_for_space(&self, max_staged: usize) -> bool {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.frozen {
                    return false;
                }
                if inner.by_id.len() < max_staged {
                    return true;
                }
            }
            space.await;
        }
    }

    /// Wake the scheduler to fetch.
    pub fn request_work(&self) {
        self.space.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn target(&self) -> usize {
        self.inner.lock().target
    }

    pub fn count_for(&self, algorithm: Algorithm) -> usize {
        self.inner
            .lock()
            .per_algo
            .get(&algorithm)
            .copied()
            .unwrap_or(0)
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock();
        QueueCounts {
            total: inner.by_id.len(),
            rollable: inner.rollable,
            spare: inner.spare,
            waiting: inner.waiting,
            target: inner.target,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().by_id.contains_key(&id)
    }
}
