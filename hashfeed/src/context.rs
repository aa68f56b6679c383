//! The shared state of the work and pool subsystem.
//!
//! One [`MiningContext`] per miner, always behind an `Arc`. Tasks get a
//! clone of the `Arc`; nothing here is a process global, so tests build as
//! many independent contexts as they like.
//!
//! Lock order, outermost first: staging queue, pool registry, pool state,
//! goal blockchain. Stratum session locks are taken before pool state or on
//! their own.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MinerConfig;
use crate::device::{Device, DeviceRegistry};
use crate::error::{ConfigError, PoolError};
use crate::goal::{Algorithm, GoalTable};
use crate::pool::{
    Liveness, Pool, PoolEnableState, PoolInfo, PoolRegistry, PoolSpec, PoolSwitch, Protocol,
    Strategy, connection_cap, liveness, same_pool,
};
use crate::protocol::{ProtocolClient, RawPayload, RawWork, StratumTransport};
use crate::stats::{MinerStats, ShareCounters};
use crate::submit::dedup::ShareDedup;
use crate::submit::pending::PendingShares;
use crate::tracing::prelude::*;
use crate::types::Difficulty;
use crate::work::header;
use crate::work::staging::StagingQueue;
use crate::work::{Work, WorkError, WorkIds};

/// Why a pool is being taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    Operator,
    Rejecting,
    Misbehaving,
}

impl From<DisableReason> for PoolEnableState {
    fn from(reason: DisableReason) -> Self {
        match reason {
            DisableReason::Operator => PoolEnableState::Disabled,
            DisableReason::Rejecting => PoolEnableState::Rejecting,
            DisableReason::Misbehaving => PoolEnableState::Misbehaving,
        }
    }
}

pub struct MiningContext {
    pub config: MinerConfig,
    pub goals: GoalTable,
    pub pools: PoolRegistry,
    pub stats: Arc<MinerStats>,
    pub ids: Arc<WorkIds>,
    pub queue: StagingQueue,
    pub devices: DeviceRegistry,
    pub(crate) pending: PendingShares,
    pub(crate) dedup: ShareDedup,
    pub(crate) client: Arc<dyn ProtocolClient>,
    pub(crate) stratum: Arc<dyn StratumTransport>,
    submit_tx: mpsc::UnboundedSender<Work>,
    submit_rx: Mutex<Option<mpsc::UnboundedReceiver<Work>>>,
    /// Restart generation; bumped whenever devices must drop their work.
    pub(crate) restart: watch::Sender<u64>,
    /// Signaled when the current pool changes or a pool goes away.
    pub pool_switched: Notify,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

impl MiningContext {
    pub fn new(
        config: MinerConfig,
        client: Arc<dyn ProtocolClient>,
        stratum: Arc<dyn StratumTransport>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let stats = Arc::new(MinerStats::default());
        let ids = Arc::new(WorkIds::new());
        let goals = GoalTable::new();
        let pools = PoolRegistry::new(config.strategy, config.rotate_period());
        for pc in &config.pools {
            let goal = goals.get_or_create(&pc.goal, pc.algorithm);
            let pool = pools.add_pool(
                PoolSpec {
                    url: pc.url.clone(),
                    user: pc.user.clone(),
                    pass: pc.pass.clone(),
                    proxy: pc.proxy.clone(),
                    quota: pc.quota,
                    failover_only: pc.failover_only,
                    direct_block_submit: pc.direct_block_submit,
                },
                goal,
            );
            debug!(pool = pool.number(), url = %pool.url(), goal = %pc.goal, "Pool configured.");
        }

        let queue = StagingQueue::new(
            ids.clone(),
            stats.clone(),
            config.queue,
            config.pop_preference,
        );
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (restart, _) = watch::channel(0);

        Ok(Arc::new(Self {
            config,
            goals,
            pools,
            stats,
            ids,
            queue,
            devices: DeviceRegistry::new(),
            pending: PendingShares::new(),
            dedup: ShareDedup::default(),
            client,
            stratum,
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            restart,
            pool_switched: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }))
    }

    /// The submission queue. There is one consumer; later calls get `None`.
    pub fn take_submit_receiver(&self) -> Option<mpsc::UnboundedReceiver<Work>> {
        self.submit_rx.lock().take()
    }

    pub fn subscribe_restart(&self) -> watch::Receiver<u64> {
        self.restart.subscribe()
    }

    pub fn mining_threads(&self) -> usize {
        self.devices.thread_count()
    }

    /// Staged work the scheduler aims to keep: the queue target plus one
    /// per device thread.
    pub fn max_staged(&self) -> usize {
        self.queue.target() + self.mining_threads()
    }

    pub fn connection_cap(&self) -> usize {
        connection_cap(self.mining_threads(), self.config.queue, self.config.delaynet)
    }

    /// Stage work, discarding it if the queue no longer takes any.
    pub fn stage_work(&self, work: Work) {
        if let Err(work) = self.queue.stage(work) {
            trace!(work_id = work.id(), "Queue frozen, discarding work.");
            self.queue.discard(work);
        }
    }

    /// Drop staged work from `pool`, along with any template kept for local
    /// generation.
    pub fn clear_pool_work(&self, pool: &Arc<Pool>) -> usize {
        let cleared = self
            .queue
            .discard_where(|w| same_pool(&w.pool, pool) && !w.mandatory);
        pool.state().template = None;
        if cleared > 0 {
            debug!(pool = pool.number(), cleared, "Cleared staged work.");
        }
        cleared
    }

    /// Select a pool to fetch from, testing it first unless it is known
    /// alive. Dead pools are marked and selection is retried.
    pub async fn select_pool(
        &self,
        lagging: bool,
        algo: Option<Algorithm>,
    ) -> Result<Arc<Pool>, PoolError> {
        let mut last = None;
        for _ in 0..self.pools.len().max(1) {
            let pool = self
                .pools
                .select_pool(lagging, algo, self.config.fail_only)
                .ok_or(PoolError::NoUsablePool)?;
            if matches!(pool.liveness(), Liveness::Alive | Liveness::Testing) {
                return Ok(pool);
            }
            if liveness::pool_active(self, &pool, false).await {
                liveness::pool_resus(self, &pool);
                return Ok(pool);
            }
            liveness::pool_died(self, &pool);
            last = Some(pool);
        }
        last.ok_or(PoolError::NoUsablePool)
    }

    /// Recompute the current pool, optionally promoting `selected` to the
    /// top priority first.
    ///
    /// Unless several pools are meant to be active at once, locally made
    /// work from the previous pool is dropped on a change.
    pub fn switch_pools(&self, selected: Option<&Arc<Pool>>) -> PoolSwitch {
        let switch = self.pools.switch_pools(selected);
        if !switch.changed() {
            return switch;
        }

        if let Some(to) = &switch.to {
            info!(pool = to.number(), url = %to.url(), "Switching to pool.");
        }
        if let Some(from) = &switch.from
            && !self.pools.strategy().is_multi_pool()
        {
            let cleared = self.queue.discard_where(|w| {
                same_pool(&w.pool, from)
                    && !w.mandatory
                    && (w.clone || w.rolls > 0 || w.protocol != Protocol::GetWork)
            });
            from.state().template = None;
            debug!(pool = from.number(), cleared, "Cleared local work of previous pool.");
        }
        self.pool_switched.notify_waiters();
        switch
    }

    /// Enable a pool. Becomes current straight away if it outranks the
    /// current pool.
    pub fn enable_pool(&self, number: usize) -> Result<Arc<Pool>, PoolError> {
        let pool = self.pools.pool(number)?;
        self.set_pool_enabled(&pool)?;
        Ok(pool)
    }

    /// [`Self::enable_pool`] by handle, for callers that may race with
    /// removal.
    pub fn set_pool_enabled(&self, pool: &Arc<Pool>) -> Result<(), PoolError> {
        self.pools
            .set_pool_enable_state(pool, PoolEnableState::Enabled)?;
        info!(pool = pool.number(), url = %pool.url(), "Pool enabled.");

        let prio = pool.state().prio;
        let outranks = match self.pools.current() {
            Some(cp) => {
                let current_prio = cp.state().prio;
                prio < current_prio
            }
            None => true,
        };
        if outranks {
            self.switch_pools(None);
        }
        Ok(())
    }

    pub fn disable_pool(
        &self,
        number: usize,
        reason: DisableReason,
    ) -> Result<Arc<Pool>, PoolError> {
        let pool = self.pools.pool(number)?;
        self.set_pool_disabled(&pool, reason)?;
        Ok(pool)
    }

    pub fn set_pool_disabled(
        &self,
        pool: &Arc<Pool>,
        reason: DisableReason,
    ) -> Result<(), PoolError> {
        self.pools.set_pool_enable_state(pool, reason.into())?;
        match reason {
            DisableReason::Operator => {
                info!(pool = pool.number(), url = %pool.url(), "Pool disabled.")
            }
            _ => warn!(pool = pool.number(), url = %pool.url(), ?reason, "Pool disabled."),
        }
        if self.pools.is_current(pool) {
            self.switch_pools(None);
        }
        Ok(())
    }

    /// Add a pool at the lowest priority. New goals default to SHA-256d.
    pub fn add_pool(&self, url: &str, user: &str, pass: &str, goal: &str) -> Arc<Pool> {
        let algorithm = self
            .goals
            .get(goal)
            .map(|g| g.algorithm())
            .unwrap_or_default();
        let goal = self.goals.get_or_create(goal, algorithm);
        let pool = self.pools.add_pool(PoolSpec::new(url, user, pass), goal);
        info!(pool = pool.number(), url = %pool.url(), "Added pool.");
        pool
    }

    /// Remove a pool. The last pool and the current pool stay.
    pub fn remove_pool(&self, number: usize) -> Result<Arc<Pool>, PoolError> {
        let pool = self.pools.pool(number)?;
        if self.pools.len() <= 1 {
            return Err(PoolError::LastPool(number));
        }
        if self.pools.is_current(&pool) {
            return Err(PoolError::ActivePool(number));
        }
        if !self.pools.remove_pool(number) {
            return Err(PoolError::UnknownPool(number));
        }

        self.clear_pool_work(&pool);
        // Wakes the pool's longpoll listener so it can exit
        self.pool_switched.notify_waiters();
        info!(url = %pool.url(), "Removed pool.");
        Ok(pool)
    }

    pub fn set_priority(&self, number: usize, prio: usize) -> Result<(), PoolError> {
        self.pools.set_priority(number, prio)?;
        if !matches!(
            self.pools.strategy(),
            Strategy::RoundRobin | Strategy::Rotate
        ) {
            self.switch_pools(None);
        }
        Ok(())
    }

    pub fn set_quota(&self, number: usize, quota: u32) -> Result<u32, PoolError> {
        let gcd = self.pools.set_quota(number, quota)?;
        info!(pool = number, quota, gcd, "Pool quota changed.");
        Ok(gcd)
    }

    pub fn switch_strategy(&self, strategy: Strategy, rotate_period: Option<Duration>) {
        self.pools.switch_strategy(strategy, rotate_period);
        info!(%strategy, "Pool strategy changed.");
        self.switch_pools(None);
    }

    pub fn list_pools(&self) -> Vec<PoolInfo> {
        self.pools.list_pools()
    }

    /// Turn a protocol reply into work, recording what it says about the
    /// pool.
    pub fn work_from_raw(&self, pool: &Arc<Pool>, raw: RawWork) -> Result<Work, WorkError> {
        {
            let mut state = pool.state();
            state.submit_old = raw.submit_old;
            if raw.longpoll_url.is_some() {
                state.longpoll_url = raw.longpoll_url.clone();
            }
            state.last_work = Some(Instant::now());
        }
        ShareCounters::bump(&self.stats.shares.getworks);
        ShareCounters::bump(&pool.stats.getworks);

        match raw.payload {
            RawPayload::Header { header, target } => {
                let mut work = Work::new(&self.ids, pool.clone(), header, target, Protocol::GetWork);
                work.rolltime = raw.rolltime;
                Ok(work)
            }
            RawPayload::Template(template) => {
                let template = Arc::new(template);
                pool.state().template = Some(template.clone());
                Work::from_template(&self.ids, pool.clone(), &template)
            }
        }
    }

    /// Claim the right to start the pool's longpoll listener. True once per
    /// pool, after it has advertised a longpoll URL.
    pub fn claim_longpoll(&self, pool: &Pool) -> bool {
        let mut state = pool.state();
        if state.longpoll_url.is_some() && !state.longpoll_running && !state.removed {
            state.longpoll_running = true;
            true
        } else {
            false
        }
    }

    /// Wait for work suited to `device`. `None` once shutting down.
    pub async fn pop_work(&self, device: &Device) -> Option<Work> {
        let mut work = self
            .queue
            .pop(device.capability(), |w| {
                let check = self.stale_check();
                check.can_roll(w) && check.should_roll(w)
            })
            .await?;
        work.device = Some(device.id());
        device.note_work();
        Some(work)
    }

    /// A device reports `nonce` for `work`.
    ///
    /// SHA-256d work is hash-tested here: a nonce that fails difficulty 1
    /// is a hardware error, one that passes but misses the share target is
    /// dropped. Returns whether the nonce went on to be submitted.
    pub fn submit_nonce(&self, work: &Work, nonce: u32) -> bool {
        let mut share = work.for_share(&self.ids, nonce, work.device);
        let device = share.device.and_then(|id| self.devices.get(id));

        if share.algorithm() == Algorithm::Sha256d {
            let hash = header::hash(&share.header);
            if hash[28..] != [0u8; 4] {
                ShareCounters::bump(&self.stats.shares.hw_errors);
                ShareCounters::bump(&share.pool.stats.hw_errors);
                if let Some(device) = &device {
                    ShareCounters::bump(&device.stats.hw_errors);
                }
                warn!(device = ?share.device, work_id = work.id(), nonce, "Hardware error.");
                return false;
            }
            share.share_difficulty = Difficulty::from_hash(&hash).as_f64();
            if !header::meets_target(&share.header, share.target) {
                trace!(work_id = work.id(), nonce, "Nonce below share target.");
                return false;
            }
        } else {
            share.share_difficulty = share.difficulty.as_f64();
        }

        self.submit_async(share);
        true
    }

    /// Hand a share to the submission worker.
    pub fn submit_async(&self, share: Work) {
        self.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.submit_tx.send(share) {
            self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
            warn!(work_id = e.0.id(), "Submission pipeline closed, dropping share.");
        }
    }

    /// Send an already counted share through the pipeline again.
    pub(crate) fn resubmit(&self, share: Work) {
        if let Err(e) = self.submit_tx.send(share) {
            self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
            warn!(work_id = e.0.id(), "Submission pipeline closed, dropping share.");
        }
    }

    pub fn report_device_alive(&self, device: usize) {
        self.devices.heartbeat(device);
    }
}
