//! Work synthesis from stratum job notifications.
//!
//! The socket side of stratum lives outside this crate. It reports session
//! and job events through the `on_*` methods on [`MiningContext`], already
//! decoded into [`StratumJob`]. From the last notified job, work is made
//! locally by rolling extranonce2; no network round trip per unit.

use std::sync::Arc;

use parking_lot::RwLockUpgradableReadGuard;
use tokio::time::Instant;

use super::extranonce2::{Extranonce2, Extranonce2Counter};
use super::header::{self, STRATUM_HEIGHT_OFFSET};
use super::{Work, WorkError, WorkExtension, WorkIds};
use crate::context::MiningContext;
use crate::pool::{Pool, Protocol};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// A `mining.notify` job, decoded.
#[derive(Debug, Clone)]
pub struct StratumJob {
    pub job_id: String,
    /// Previous block hash in internal byte order.
    pub prev_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: u32,
    pub bits: u32,
    pub ntime: u32,
    /// Pool asked for in-progress work to be abandoned.
    pub clean: bool,
}

impl StratumJob {
    pub fn height(&self) -> Option<u64> {
        header::bip34_height(&self.coinbase1, STRATUM_HEIGHT_OFFSET)
    }
}

/// Per-pool stratum session state.
#[derive(Debug, Default)]
pub struct StratumSession {
    /// Socket is up and subscribed.
    pub active: bool,
    /// At least one job has arrived on this session.
    pub notified: bool,
    pub session_id: Option<String>,
    pub nonce1: Vec<u8>,
    pub nonce2: Option<Extranonce2Counter>,
    pub job: Option<StratumJob>,
    pub notified_at: Option<Instant>,
    pub difficulty: Option<Difficulty>,
}

impl StratumSession {
    /// Ready to synthesize work.
    pub fn is_ready(&self) -> bool {
        self.active && self.notified && self.job.is_some() && self.nonce2.is_some()
    }
}

/// What a stratum work item was built from, for share submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumBinding {
    pub job_id: String,
    pub nonce1: Vec<u8>,
    pub nonce2: Extranonce2,
}

/// Parameters of a `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumSubmit {
    pub user: String,
    pub job_id: String,
    pub nonce2: String,
    pub ntime: u32,
    pub nonce: u32,
}

impl StratumSubmit {
    pub fn for_work(work: &Work, binding: &StratumBinding) -> Self {
        Self {
            user: work.pool.user().to_string(),
            job_id: binding.job_id.clone(),
            nonce2: binding.nonce2.to_string(),
            ntime: header::ntime(&work.header),
            nonce: header::nonce(&work.header),
        }
    }
}

/// Build one unit of work from the pool's current job.
pub fn gen_stratum_work(pool: &Arc<Pool>, ids: &WorkIds) -> Result<Work, WorkError> {
    let session = pool.stratum.upgradable_read();
    if !session.is_ready() {
        return Err(WorkError::NoStratumJob);
    }

    let mut session = RwLockUpgradableReadGuard::upgrade(session);
    let nonce2 = session
        .nonce2
        .as_mut()
        .and_then(Extranonce2Counter::allocate)
        .ok_or(WorkError::Nonce2Exhausted)?;
    let session = parking_lot::RwLockWriteGuard::downgrade(session);

    let job = session.job.as_ref().ok_or(WorkError::NoStratumJob)?;
    let mut coinbase = Vec::with_capacity(
        job.coinbase1.len() + session.nonce1.len() + nonce2.size() + job.coinbase2.len(),
    );
    coinbase.extend_from_slice(&job.coinbase1);
    coinbase.extend_from_slice(&session.nonce1);
    coinbase.extend_from_slice(&nonce2.to_bytes());
    coinbase.extend_from_slice(&job.coinbase2);

    let leaf = header::hash_bytes(&coinbase);
    let merkle_root = header::merkle_root_from_branch(leaf, &job.merkle_branch);

    let since_notify = session
        .notified_at
        .map(|t| u32::try_from(t.elapsed().as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0);
    let header = header::assemble(
        job.version,
        &job.prev_hash,
        &merkle_root,
        job.ntime.wrapping_add(since_notify),
        job.bits,
    );

    let target = session.difficulty.unwrap_or(Difficulty::ONE).to_target();
    let mut work = Work::new(ids, pool.clone(), header, target, Protocol::Stratum);
    work.height = job.height().unwrap_or(0);
    work.extension = Some(WorkExtension::Stratum(StratumBinding {
        job_id: job.job_id.clone(),
        nonce1: session.nonce1.clone(),
        nonce2,
    }));
    Ok(work)
}

impl MiningContext {
    /// The socket layer finished `mining.subscribe`.
    pub fn on_stratum_subscribed(
        &self,
        pool: &Arc<Pool>,
        nonce1: Vec<u8>,
        nonce2_size: usize,
        session_id: Option<String>,
    ) -> Result<(), WorkError> {
        let counter = Extranonce2Counter::new(nonce2_size)?;
        {
            let mut session = pool.stratum.write();
            let resumed = session.session_id.is_some() && session.session_id == session_id;
            if !resumed {
                session.notified = false;
                session.job = None;
            }
            session.active = true;
            session.session_id = session_id;
            session.nonce1 = nonce1;
            session.nonce2 = Some(counter);
        }
        pool.state().protocol = Protocol::Stratum;
        info!(pool = pool.number(), url = %pool.url(), "Stratum subscribed.");
        Ok(())
    }

    pub fn on_stratum_difficulty(&self, pool: &Arc<Pool>, difficulty: f64) {
        let difficulty = Difficulty::from_f64(difficulty);
        debug!(pool = pool.number(), difficulty = %difficulty, "Stratum difficulty changed.");
        pool.stratum.write().difficulty = Some(difficulty);
    }

    /// A new job arrived. Clean jobs are treated like a longpoll reply.
    pub fn on_stratum_notify(&self, pool: &Arc<Pool>, job: StratumJob) {
        let clean = job.clean;
        debug!(pool = pool.number(), job_id = %job.job_id, clean, "Stratum job.");
        {
            let mut session = pool.stratum.write();
            session.job = Some(job);
            session.notified = true;
            session.notified_at = Some(Instant::now());
        }

        let mut work = match gen_stratum_work(pool, &self.ids) {
            Ok(work) => work,
            Err(e) => {
                warn!(pool = pool.number(), error = %e, "Cannot build work from stratum job.");
                return;
            }
        };
        work.longpoll = clean;
        self.test_work_current(&mut work);
        self.stage_work(work);
    }

    /// The socket dropped. Pending shares are handed to the submission
    /// pipeline to resubmit or write off.
    pub fn on_stratum_disconnect(&self, pool: &Arc<Pool>) {
        {
            let mut session = pool.stratum.write();
            session.active = false;
            session.notified = false;
        }
        warn!(pool = pool.number(), url = %pool.url(), "Stratum disconnected.");
        self.clear_stratum_shares(pool);
        self.clear_pool_work(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{stratum_job, test_context};

    #[tokio::test]
    async fn test_not_ready_without_job() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        assert!(matches!(
            gen_stratum_work(&pool, &ctx.ids),
            Err(WorkError::NoStratumJob)
        ));
    }

    #[tokio::test]
    async fn test_each_work_gets_its_own_nonce2() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        ctx.on_stratum_subscribed(&pool, vec![0xaa, 0xbb], 4, None)
            .unwrap();
        pool.stratum.write().job = Some(stratum_job("j1", [3u8; 32], false));
        pool.stratum.write().notified = true;

        let a = gen_stratum_work(&pool, &ctx.ids).unwrap();
        let b = gen_stratum_work(&pool, &ctx.ids).unwrap();

        let (Some(WorkExtension::Stratum(ba)), Some(WorkExtension::Stratum(bb))) =
            (&a.extension, &b.extension)
        else {
            panic!("stratum work must carry its binding");
        };
        assert_eq!(ba.nonce2.value(), 0);
        assert_eq!(bb.nonce2.value(), 1);
        assert_eq!(ba.nonce1, vec![0xaa, 0xbb]);
        assert_ne!(header::merkle_root(&a.header), header::merkle_root(&b.header));
        assert_eq!(header::prev_hash(&a.header), [3u8; 32]);
        assert_eq!(a.height, 200_000);
        assert_eq!(a.protocol, Protocol::Stratum);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_nonce2_exhaustion() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        ctx.on_stratum_subscribed(&pool, vec![], 1, None).unwrap();
        pool.stratum.write().job = Some(stratum_job("j1", [3u8; 32], false));
        pool.stratum.write().notified = true;

        for _ in 0..256 {
            gen_stratum_work(&pool, &ctx.ids).unwrap();
        }
        assert!(matches!(
            gen_stratum_work(&pool, &ctx.ids),
            Err(WorkError::Nonce2Exhausted)
        ));
    }

    #[tokio::test]
    async fn test_notify_stages_work_and_tracks_block() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        ctx.on_stratum_subscribed(&pool, vec![1], 4, Some("s1".into()))
            .unwrap();
        ctx.on_stratum_notify(&pool, stratum_job("j1", [5u8; 32], true));

        assert_eq!(ctx.queue.len(), 1);
        assert_eq!(pool.goal().blockchain.len(), 1);
        assert!(pool.stratum.read().is_ready());
    }

    #[tokio::test]
    async fn test_resubscribe_with_same_session_keeps_job() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        ctx.on_stratum_subscribed(&pool, vec![1], 4, Some("s1".into()))
            .unwrap();
        ctx.on_stratum_notify(&pool, stratum_job("j1", [5u8; 32], false));
        ctx.on_stratum_disconnect(&pool);
        assert!(!pool.stratum.read().is_ready());

        ctx.on_stratum_subscribed(&pool, vec![1], 4, Some("s1".into()))
            .unwrap();
        assert!(pool.stratum.read().job.is_some());

        ctx.on_stratum_subscribed(&pool, vec![2], 4, Some("s2".into()))
            .unwrap();
        assert!(pool.stratum.read().job.is_none());
    }
}
