//! Stratum shares sent and awaiting the pool's reply.
//!
//! Whoever takes a share out of the table owns its final accounting. A
//! share is taken exactly once, whether by its reply, by a failed send
//! rolling back, or by a disconnect clearing the pool, so a share is never
//! counted twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::pool::{Pool, same_pool};
use crate::work::Work;

#[derive(Debug)]
struct PendingShare {
    work: Work,
    sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct PendingShares {
    shares: Mutex<HashMap<u64, PendingShare>>,
    next_id: AtomicU64,
}

impl PendingShares {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a share; returns its id for reply correlation.
    pub fn insert(&self, work: Work) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shares.lock().insert(
            id,
            PendingShare {
                work,
                sent_at: Instant::now(),
            },
        );
        id
    }

    pub fn take(&self, id: u64) -> Option<Work> {
        self.shares.lock().remove(&id).map(|p| p.work)
    }

    /// Take every share sent to `pool`, oldest first.
    pub fn take_for_pool(&self, pool: &Arc<Pool>) -> Vec<Work> {
        let mut shares = self.shares.lock();
        let ids: Vec<u64> = shares
            .iter()
            .filter(|(_, p)| same_pool(&p.work.pool, pool))
            .map(|(id, _)| *id)
            .collect();
        let mut taken: Vec<PendingShare> =
            ids.iter().filter_map(|id| shares.remove(id)).collect();
        taken.sort_by_key(|p| p.sent_at);
        taken.into_iter().map(|p| p.work).collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.shares.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shares.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.lock().is_empty()
    }
}
