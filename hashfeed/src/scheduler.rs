//! The work scheduler.
//!
//! One task keeps the staging queue at its target depth. Each round picks
//! a pool by strategy and gets one unit of work from wherever is cheapest:
//! the pool's stratum job, a block template kept from an earlier fetch, or
//! a network request. Algorithms with waiting devices and nothing staged
//! are topped up first, ahead of the general refill.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::MiningContext;
use crate::error::Error;
use crate::goal::Algorithm;
use crate::longpoll;
use crate::pool::liveness::{pool_died, pool_resus};
use crate::pool::{Pool, Protocol, same_pool};
use crate::protocol::ProtocolError;
use crate::stats::ShareCounters;
use crate::tracing::prelude::*;
use crate::work::stratum::gen_stratum_work;
use crate::work::{Work, WorkError};

/// First pause after a failed round.
const INITIAL_PAUSE: Duration = Duration::from_secs(1);

/// Pause after consecutive failed rounds: the initial pause doubled per
/// failure, capped at the fail pause, then jittered into the upper half of
/// that so miners behind the same outage do not retry in lockstep.
struct RetryPause {
    initial: Duration,
    cap: Duration,
    failures: u32,
    attempts: u64,
    jitter: RandomState,
}

impl RetryPause {
    fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            failures: 0,
            attempts: 0,
            jitter: RandomState::new(),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let nominal = self
            .initial
            .saturating_mul(1 << self.failures.min(16))
            .min(self.cap);
        self.failures = self.failures.saturating_add(1);
        self.attempts = self.attempts.wrapping_add(1);

        let fraction = self.jitter.hash_one(self.attempts) as f64 / u64::MAX as f64;
        nominal.mul_f64(0.5 + fraction / 2.0)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Run the scheduler until shutdown or until the queue freezes.
pub async fn task(ctx: Arc<MiningContext>) {
    let mut pause = RetryPause::new(INITIAL_PAUSE, ctx.config.fail_pause().max(INITIAL_PAUSE));

    loop {
        let (algo, spare) = match starved_algorithm(&ctx) {
            Some(algo) => (Some(algo), true),
            None => {
                let has_space = tokio::select! {
                    has_space = ctx.queue.wait_for_space(ctx.max_staged()) => has_space,
                    _ = ctx.shutdown.cancelled() => false,
                };
                if !has_space {
                    break;
                }
                (None, false)
            }
        };

        let lagging = ctx.pools.current().is_some_and(|cp| cp.state().lagging);
        match fetch_one(&ctx, algo, lagging, spare).await {
            Ok(()) => pause.reset(),
            Err(e) => {
                let delay = pause.next_delay();
                debug!(error = %e, ?delay, "No work this round.");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.shutdown.cancelled() => break,
                }
            }
        }
    }
    debug!("Scheduler stopped.");
}

/// An algorithm some device hashes with less staged than the floor. Only
/// relevant when devices hash more than one algorithm.
fn starved_algorithm(ctx: &MiningContext) -> Option<Algorithm> {
    let algorithms = ctx.devices.algorithms();
    if algorithms.len() < 2 {
        return None;
    }
    algorithms
        .into_iter()
        .find(|algo| ctx.queue.count_for(*algo) < ctx.config.algo_floor)
}

/// Produce and stage one unit of work.
pub(crate) async fn fetch_one(
    ctx: &Arc<MiningContext>,
    algo: Option<Algorithm>,
    lagging: bool,
    spare: bool,
) -> Result<(), Error> {
    let pool = ctx.select_pool(lagging, algo).await?;

    if pool.protocol() == Protocol::Stratum {
        if pool.stratum.read().is_ready() {
            return stage_stratum(ctx, &pool, spare);
        }
        let Some(alternate) = alternate_pool(ctx, &pool, algo) else {
            trace!(pool = pool.number(), "Stratum pool not ready.");
            return Err(WorkError::NoStratumJob.into());
        };
        debug!(from = pool.number(), to = alternate.number(), "Stratum pool not ready, using alternate.");
        if alternate.protocol() == Protocol::Stratum {
            return stage_stratum(ctx, &alternate, spare);
        }
        return fetch_network(ctx, &alternate, spare).await;
    }

    if let Some(mut work) = template_work(ctx, &pool) {
        work.spare = spare;
        ctx.stage_work(work);
        return Ok(());
    }
    fetch_network(ctx, &pool, spare).await
}

fn stage_stratum(ctx: &MiningContext, pool: &Arc<Pool>, spare: bool) -> Result<(), Error> {
    let mut work = gen_stratum_work(pool, &ctx.ids)?;
    work.spare = spare;
    ShareCounters::bump(&pool.stats.local_work);
    ctx.stage_work(work);
    Ok(())
}

/// A workable pool other than `pool` that can hand out work right now.
fn alternate_pool(
    ctx: &MiningContext,
    pool: &Arc<Pool>,
    algo: Option<Algorithm>,
) -> Option<Arc<Pool>> {
    ctx.pools.priority_order().into_iter().find(|p| {
        !same_pool(p, pool)
            && p.is_workable()
            && algo.is_none_or(|a| p.algorithm() == a)
            && (p.protocol() != Protocol::Stratum || p.stratum.read().is_ready())
    })
}

/// Next header from the pool's kept block template, if it has enough left
/// to be worth using and is still current.
fn template_work(ctx: &MiningContext, pool: &Arc<Pool>) -> Option<Work> {
    let template = pool.state().template.clone()?;
    let wanted = u32::try_from(ctx.mining_threads().max(1)).unwrap_or(u32::MAX);
    if template.work_left() < wanted {
        return None;
    }
    let work = Work::from_template(&ctx.ids, pool.clone(), &template).ok()?;
    if ctx.is_stale(&work, false) {
        trace!(pool = pool.number(), "Kept template is stale.");
        pool.state().template = None;
        return None;
    }
    ShareCounters::bump(&pool.stats.local_work);
    Some(work)
}

async fn fetch_network(ctx: &Arc<MiningContext>, pool: &Arc<Pool>, spare: bool) -> Result<(), Error> {
    let conn = pool
        .connections
        .pop(ctx.connection_cap(), pool.proxy())
        .await?;

    let started = Instant::now();
    let mut protocol = pool.protocol();
    let result = loop {
        match ctx.client.fetch_work(&conn, pool, protocol, false).await {
            Err(ProtocolError::ProtocolMismatch(reason))
                if protocol == Protocol::GetBlockTemplate =>
            {
                info!(pool = pool.number(), %reason, "Pool lacks block template support, using getwork.");
                protocol = Protocol::GetWork;
                pool.state().protocol = Protocol::GetWork;
            }
            other => break other,
        }
    };
    pool.connections.push(conn);

    let raw = match result {
        Ok(raw) => raw,
        Err(e) => {
            ShareCounters::bump(&ctx.stats.shares.get_failures);
            ShareCounters::bump(&pool.stats.get_failures);
            let seq_getfails = {
                let mut state = pool.state();
                state.seq_getfails += 1;
                state.seq_getfails
            };
            warn!(pool = pool.number(), error = %e, seq_getfails, "Failed to fetch work.");
            let threshold = ctx.mining_threads() + ctx.config.queue;
            if usize::try_from(seq_getfails).unwrap_or(usize::MAX) > threshold {
                pool_died(ctx, pool);
            }
            return Err(e.into());
        }
    };

    {
        let mut state = pool.state();
        state.record_getwork_rtt(started.elapsed());
        state.seq_getfails = 0;
    }
    let mut work = ctx.work_from_raw(pool, raw)?;
    work.spare = spare;
    ctx.test_work_current(&mut work);
    trace!(pool = pool.number(), work_id = work.id(), "Fetched work.");
    ctx.stage_work(work);
    if ctx.queue.len() >= ctx.queue.target() {
        pool.state().lagging = false;
    }

    if ctx.claim_longpoll(pool) {
        longpoll::spawn(ctx, pool.clone());
    }
    if pool.liveness().is_down() {
        pool_resus(ctx, pool);
    }
    Ok(())
}
