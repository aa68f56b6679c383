//! Block templates from getblocktemplate.
//!
//! A template is fetched once and shared as `Arc<BlockTemplate>` by every
//! work item generated from it, clones included. It is released when the
//! last such work item is dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bitcoin::consensus::encode::{VarInt, serialize};
use bitcoin::pow::Target;
use tokio::time::Instant;

use super::header::{self, Header};

/// Default roll budget when the pool says nothing about expiry.
const DEFAULT_EXPIRY: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct BlockTemplate {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub bits: u32,
    pub curtime: u32,
    pub height: u64,
    pub target: Target,
    /// Serialized coinbase transaction.
    pub coinbase: Vec<u8>,
    /// Serialized non-coinbase transactions, in block order.
    pub transactions: Vec<Vec<u8>>,
    merkle_root: [u8; 32],
    /// Whether the pool lets us move the time field.
    time_mutable: bool,
    expires: Duration,
    received: Instant,
    /// Time offsets handed out so far.
    issued: AtomicU32,
}

impl BlockTemplate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u32,
        prev_hash: [u8; 32],
        bits: u32,
        curtime: u32,
        height: u64,
        target: Target,
        coinbase: Vec<u8>,
        transactions: Vec<Vec<u8>>,
        time_mutable: bool,
        expires: Option<Duration>,
    ) -> Self {
        let txids: Vec<[u8; 32]> = std::iter::once(&coinbase)
            .chain(transactions.iter())
            .map(|tx| header::hash_bytes(tx))
            .collect();
        let merkle_root = header::merkle_root_from_txids(&txids).unwrap_or([0u8; 32]);
        Self {
            version,
            prev_hash,
            bits,
            curtime,
            height,
            target,
            coinbase,
            transactions,
            merkle_root,
            time_mutable,
            expires: expires.unwrap_or(DEFAULT_EXPIRY),
            received: Instant::now(),
            issued: AtomicU32::new(0),
        }
    }

    pub fn expires(&self) -> Duration {
        self.expires
    }

    /// Headers this template can still produce.
    ///
    /// Each header gets its own time offset, so the budget is the number of
    /// seconds left before the template expires. A template whose time
    /// field is fixed yields a single header.
    pub fn work_left(&self) -> u32 {
        let issued = self.issued.load(Ordering::Relaxed);
        if !self.time_mutable {
            return u32::from(issued == 0);
        }
        let remaining = self.expires.saturating_sub(self.received.elapsed()).as_secs();
        u32::try_from(remaining)
            .unwrap_or(u32::MAX)
            .saturating_sub(issued)
    }

    /// Next header from the budget, or `None` when it is used up.
    pub fn next_header(&self) -> Option<Header> {
        if self.work_left() == 0 {
            return None;
        }
        let offset = self.issued.fetch_add(1, Ordering::Relaxed);
        let elapsed = u32::try_from(self.received.elapsed().as_secs()).unwrap_or(u32::MAX);
        let ntime = self
            .curtime
            .wrapping_add(elapsed.max(offset));
        Some(header::assemble(
            self.version,
            &self.prev_hash,
            &self.merkle_root,
            ntime,
            self.bits,
        ))
    }

    /// Full serialized block for a solved header.
    pub fn block_bytes(&self, solved: &Header) -> Vec<u8> {
        let tx_count = VarInt(1 + self.transactions.len() as u64);
        let mut block = Vec::with_capacity(
            solved.len()
                + 9
                + self.coinbase.len()
                + self.transactions.iter().map(Vec::len).sum::<usize>(),
        );
        block.extend_from_slice(solved);
        block.extend_from_slice(&serialize(&tx_count));
        block.extend_from_slice(&self.coinbase);
        for tx in &self.transactions {
            block.extend_from_slice(tx);
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn template(time_mutable: bool) -> BlockTemplate {
        BlockTemplate::new(
            0x2000_0000,
            [7u8; 32],
            0x1d00ffff,
            1_700_000_000,
            800_000,
            Target::MAX,
            vec![1, 2, 3],
            vec![vec![4, 5], vec![6]],
            time_mutable,
            Some(Duration::from_secs(60)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_budget_counts_down() {
        let tmpl = template(true);
        assert_eq!(tmpl.work_left(), 60);

        let first = tmpl.next_header().unwrap();
        let second = tmpl.next_header().unwrap();
        assert_eq!(tmpl.work_left(), 58);
        assert_ne!(header::ntime(&first), header::ntime(&second));
        assert_eq!(header::prev_hash(&first), [7u8; 32]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tmpl.work_left(), 0);
        assert!(tmpl.next_header().is_none());
    }

    #[test]
    fn test_fixed_time_template_yields_once() {
        let tmpl = template(false);
        assert!(tmpl.next_header().is_some());
        assert!(tmpl.next_header().is_none());
    }

    #[test]
    fn test_block_bytes_layout() {
        let tmpl = Arc::new(template(true));
        let header = [9u8; 80];
        let block = tmpl.block_bytes(&header);
        assert_eq!(&block[..80], &header);
        assert_eq!(block[80], 3, "tx count varint");
        assert_eq!(&block[81..], &[1, 2, 3, 4, 5, 6]);
    }
}
