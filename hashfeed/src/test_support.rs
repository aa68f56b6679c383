//! Fixtures shared by unit tests across the crate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::pow::Target;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{MinerConfig, PoolConfig};
use crate::context::MiningContext;
use crate::pool::{Connection, Pool, Protocol};
use crate::protocol::{ProtocolClient, ProtocolError, RawReply, RawWork, StratumTransport};
use crate::work::header::{self, Header};
use crate::work::stratum::{StratumJob, StratumSubmit};
use crate::work::Work;

/// Config with `pools` HTTP pools named pool0, pool1, ...
pub(crate) fn test_config(pools: usize) -> MinerConfig {
    MinerConfig {
        pools: (0..pools)
            .map(|i| PoolConfig {
                url: format!("http://pool{i}:8332"),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

pub(crate) fn mock_context(
    config: MinerConfig,
) -> (Arc<MiningContext>, Arc<MockClient>, Arc<MockTransport>) {
    let client = Arc::new(MockClient::default());
    let transport = Arc::new(MockTransport::default());
    let ctx = MiningContext::new(config, client.clone(), transport.clone())
        .expect("test config is valid");
    (ctx, client, transport)
}

pub(crate) fn context_with(config: MinerConfig) -> Arc<MiningContext> {
    mock_context(config).0
}

pub(crate) fn test_context(pools: usize) -> Arc<MiningContext> {
    context_with(test_config(pools))
}

pub(crate) fn header_with_prev(prev: [u8; 32]) -> Header {
    header::assemble(0x2000_0000, &prev, &[0x11; 32], 1_700_000_000, 0x1d00ffff)
}

/// Getwork-style work on `prev` with a difficulty-1 share target.
pub(crate) fn work_on(ctx: &MiningContext, pool: &Arc<Pool>, prev: [u8; 32]) -> Work {
    Work::new(
        &ctx.ids,
        pool.clone(),
        header_with_prev(prev),
        Target::MAX,
        Protocol::GetWork,
    )
}

/// The Bitcoin genesis header without its nonce, which is 2083236893.
pub(crate) fn genesis_work(ctx: &MiningContext) -> Work {
    let merkle_root: [u8; 32] =
        hex::decode("3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a")
            .expect("valid hex")
            .try_into()
            .expect("32 bytes");
    let header = header::assemble(1, &[0u8; 32], &merkle_root, 1_231_006_505, 0x1d00ffff);
    let pool = ctx.pools.pool(0).expect("context has a pool");
    Work::new(&ctx.ids, pool, header, Target::MAX, Protocol::GetWork)
}

/// A job whose coinbase encodes height 200000.
pub(crate) fn stratum_job(id: &str, prev: [u8; 32], clean: bool) -> StratumJob {
    let mut coinbase1 = vec![0u8; header::STRATUM_HEIGHT_OFFSET];
    coinbase1.extend_from_slice(&[0x03, 0x40, 0x0d, 0x03]);
    StratumJob {
        job_id: id.to_string(),
        prev_hash: prev,
        coinbase1,
        coinbase2: vec![0xff, 0xff, 0xff, 0xff],
        merkle_branch: Vec::new(),
        version: 0x2000_0000,
        bits: 0x1d00ffff,
        ntime: 1_700_000_000,
        clean,
    }
}

/// Scripted protocol client. Unscripted fetches fail, unscripted submits
/// are accepted and unscripted longpolls never complete.
#[derive(Default)]
pub(crate) struct MockClient {
    fetches: Mutex<VecDeque<Result<RawWork, ProtocolError>>>,
    submits: Mutex<VecDeque<Result<RawReply, ProtocolError>>>,
    longpolls: Mutex<VecDeque<Result<RawWork, ProtocolError>>>,
    pub fetch_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub longpoll_calls: AtomicUsize,
    /// Protocols asked for, in call order.
    pub protocols: Mutex<Vec<Protocol>>,
    pub blocks: Mutex<Vec<Vec<u8>>>,
    /// Parks block submissions after recording until `release_blocks`.
    pub hold_blocks: AtomicBool,
    pub release_blocks: Notify,
}

impl MockClient {
    pub(crate) fn push_fetch(&self, reply: Result<RawWork, ProtocolError>) {
        self.fetches.lock().push_back(reply);
    }

    pub(crate) fn push_submit(&self, reply: Result<RawReply, ProtocolError>) {
        self.submits.lock().push_back(reply);
    }

    pub(crate) fn push_longpoll(&self, reply: Result<RawWork, ProtocolError>) {
        self.longpolls.lock().push_back(reply);
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn fetch_work(
        &self,
        _conn: &Connection,
        _pool: &Pool,
        protocol: Protocol,
        _probe: bool,
    ) -> Result<RawWork, ProtocolError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.protocols.lock().push(protocol);
        let scripted = self.fetches.lock().pop_front();
        scripted.unwrap_or_else(|| Err(ProtocolError::Network("unscripted".into())))
    }

    async fn submit_work(
        &self,
        _conn: &Connection,
        _pool: &Pool,
        _work: &Work,
    ) -> Result<RawReply, ProtocolError> {
        self.submit_calls.fetch_add(1, Ordering::Relaxed);
        let scripted = self.submits.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(RawReply::accepted()))
    }

    async fn longpoll(
        &self,
        _conn: &Connection,
        _pool: &Pool,
        _url: &str,
    ) -> Result<RawWork, ProtocolError> {
        self.longpoll_calls.fetch_add(1, Ordering::Relaxed);
        let scripted = self.longpolls.lock().pop_front();
        match scripted {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }

    async fn submit_block(
        &self,
        _conn: &Connection,
        _pool: &Pool,
        block: &[u8],
    ) -> Result<RawReply, ProtocolError> {
        self.blocks.lock().push(block.to_vec());
        if self.hold_blocks.load(Ordering::Acquire) {
            self.release_blocks.notified().await;
        }
        Ok(RawReply::accepted())
    }
}

/// Records stratum submits. `hold` parks each send until `release` is
/// notified; `fail` makes sends error after recording.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub sent: Mutex<Vec<(u64, StratumSubmit)>>,
    pub fail: AtomicBool,
    pub hold: AtomicBool,
    pub resumable: AtomicBool,
    pub release: Notify,
}

#[async_trait]
impl StratumTransport for MockTransport {
    async fn submit(
        &self,
        _pool: &Pool,
        share_id: u64,
        submit: &StratumSubmit,
    ) -> Result<(), ProtocolError> {
        self.sent.lock().push((share_id, submit.clone()));
        if self.hold.load(Ordering::Relaxed) {
            self.release.notified().await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(ProtocolError::Network("connection reset".into()));
        }
        Ok(())
    }

    fn resumable(&self, _pool: &Pool) -> bool {
        self.resumable.load(Ordering::Relaxed)
    }
}
