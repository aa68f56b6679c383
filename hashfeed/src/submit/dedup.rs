//! Short-lived memory of submitted share hashes.
//!
//! Benchmark runs have no pool to catch repeats, so duplicates found by
//! more than one device are caught here instead.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// How long a share hash is remembered.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct ShareDedup {
    window: Duration,
    seen: Mutex<HashMap<[u8; 32], Instant>>,
}

impl Default for ShareDedup {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl ShareDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `hash`; true if it was already seen within the window.
    pub fn check(&self, hash: [u8; 32]) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        if seen.contains_key(&hash) {
            return true;
        }
        seen.insert(hash, now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_repeat_within_window() {
        let dedup = ShareDedup::new(Duration::from_secs(10));
        assert!(!dedup.check([1u8; 32]));
        assert!(dedup.check([1u8; 32]));
        assert!(!dedup.check([2u8; 32]));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!dedup.check([1u8; 32]), "forgotten after the window");
        assert_eq!(dedup.len(), 1);
    }
}
