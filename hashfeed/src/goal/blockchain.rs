//! Recently seen blocks for one mining goal.
//!
//! Records are keyed by the previous-block hash carried in work headers, so
//! "a new block" here means "work building on a tip we have not seen".
//! History is bounded; the oldest record goes first, but the record that is
//! currently the tip is never evicted.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tokio::time::Instant;

/// Number of block records kept per goal.
pub const BLOCK_HISTORY: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Previous-block hash in header (internal) byte order.
    pub prev_hash: [u8; 32],
    /// Compact id derived from the hash, as compared against work.
    pub block_id: u32,
    /// Height if known, else zero.
    pub height: u64,
    pub first_seen: Instant,
    /// Monotonic insertion counter across the tracker's lifetime.
    pub seen_order: u64,
}

/// Result of offering a hash to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockChange {
    /// Already known; nothing changed.
    Known,
    /// Recorded as the new tip. `first` is set for the first block of the
    /// run, which is a baseline rather than a change.
    New { record: BlockRecord, first: bool },
}

#[derive(Debug, Default)]
struct History {
    blocks: HashMap<[u8; 32], BlockRecord>,
    order: VecDeque<[u8; 32]>,
    current: Option<[u8; 32]>,
    next_order: u64,
}

#[derive(Debug)]
pub struct BlockchainTracker {
    bound: usize,
    history: RwLock<History>,
}

impl Default for BlockchainTracker {
    fn default() -> Self {
        Self::new(BLOCK_HISTORY)
    }
}

/// Block id as used for staleness comparisons: the first four bytes of
/// the previous-block hash, little-endian.
pub fn block_id_of(prev_hash: &[u8; 32]) -> u32 {
    u32::from_le_bytes([prev_hash[0], prev_hash[1], prev_hash[2], prev_hash[3]])
}

impl BlockchainTracker {
    pub fn new(bound: usize) -> Self {
        Self {
            bound: bound.max(1),
            history: RwLock::new(History::default()),
        }
    }

    pub fn contains(&self, prev_hash: &[u8; 32]) -> bool {
        self.history.read().blocks.contains_key(prev_hash)
    }

    pub fn len(&self) -> usize {
        self.history.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.read().blocks.is_empty()
    }

    pub fn current(&self) -> Option<BlockRecord> {
        let history = self.history.read();
        history.current.and_then(|h| history.blocks.get(&h).cloned())
    }

    pub fn current_block_id(&self) -> Option<u32> {
        self.history.read().current.map(|h| block_id_of(&h))
    }

    /// Record `prev_hash` as the new tip if it has not been seen.
    ///
    /// The check and insert happen under one write lock, so two pools
    /// reporting the same new block race to exactly one `New`.
    pub fn offer(&self, prev_hash: [u8; 32], height: u64) -> BlockChange {
        let mut history = self.history.write();
        if history.blocks.contains_key(&prev_hash) {
            return BlockChange::Known;
        }

        let first = history.next_order == 0;
        let record = BlockRecord {
            prev_hash,
            block_id: block_id_of(&prev_hash),
            height,
            first_seen: Instant::now(),
            seen_order: history.next_order,
        };
        history.next_order += 1;
        history.blocks.insert(prev_hash, record.clone());
        history.order.push_back(prev_hash);
        history.current = Some(prev_hash);

        while history.blocks.len() > self.bound {
            let current = history.current;
            let Some(pos) = history.order.iter().position(|h| Some(*h) != current) else {
                break;
            };
            if let Some(evicted) = history.order.remove(pos) {
                history.blocks.remove(&evicted);
            }
        }

        BlockChange::New { record, first }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> [u8; 32] {
        let mut h = [0u8; 32];
        h[0] = n;
        h[31] = 0xaa;
        h
    }

    #[test]
    fn test_first_block_is_baseline() {
        let tracker = BlockchainTracker::default();
        match tracker.offer(hash(1), 100) {
            BlockChange::New { record, first } => {
                assert!(first);
                assert_eq!(record.height, 100);
                assert_eq!(record.seen_order, 0);
            }
            BlockChange::Known => panic!("first offer must be new"),
        }
        assert!(matches!(
            tracker.offer(hash(2), 101),
            BlockChange::New { first: false, .. }
        ));
        assert_eq!(tracker.offer(hash(2), 101), BlockChange::Known);
    }

    #[test]
    fn test_history_bound_keeps_current() {
        let tracker = BlockchainTracker::default();
        for n in 0..20u8 {
            tracker.offer(hash(n), n as u64);
            assert!(tracker.len() <= BLOCK_HISTORY, "len={}", tracker.len());
            assert_eq!(tracker.current().map(|r| r.prev_hash), Some(hash(n)));
        }

        assert!(!tracker.contains(&hash(0)), "oldest evicted");
        assert!(tracker.contains(&hash(19)));
        assert!(tracker.contains(&hash(13)));
        assert!(!tracker.contains(&hash(12)));
    }

    #[test]
    fn test_bound_of_one_never_evicts_current() {
        let tracker = BlockchainTracker::new(1);
        tracker.offer(hash(1), 0);
        tracker.offer(hash(2), 0);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains(&hash(2)));
    }

    #[test]
    fn test_block_id_uses_leading_bytes() {
        let mut h = [0u8; 32];
        h[..4].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(block_id_of(&h), 0x1234_5678);
    }
}
