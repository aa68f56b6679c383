//! Pool liveness: probing pools, declaring them down, and bringing them
//! back.
//!
//! A pool that fails a probe goes `Dead`; one that was `Alive` and stops
//! answering goes `Idle`. The watcher retests down pools every
//! [`RETEST_AFTER`] and, under failover, moves back to a better pool once
//! it has stayed up for the configured fail-switch delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use super::{Liveness, Pool, PoolEnableState, Protocol, Strategy, same_pool};
use crate::context::MiningContext;
use crate::protocol::ProtocolError;
use crate::tracing::prelude::*;

/// How often the watcher runs.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// How long a down pool rests before it is tested again.
pub const RETEST_AFTER: Duration = Duration::from_secs(30);

/// Probe `pool` with a real work request, staging the work on success.
///
/// Stratum pools are active while their session is. Others are asked for a
/// block template first, dropping to getwork if the pool does not speak it.
/// `pinging` marks retests of pools already known to be down.
pub async fn pool_active(ctx: &MiningContext, pool: &Arc<Pool>, pinging: bool) -> bool {
    if pool.protocol() == Protocol::Stratum {
        return pool.stratum.read().active;
    }

    if !pinging {
        pool.state().liveness = Liveness::Testing;
    }
    debug!(pool = pool.number(), url = %pool.url(), pinging, "Testing pool.");

    let conn = match pool.connections.pop(ctx.connection_cap(), pool.proxy()).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(pool = pool.number(), error = %e, "No connection for pool test.");
            return false;
        }
    };

    let started = Instant::now();
    let mut protocol = pool.protocol();
    let result = loop {
        match ctx.client.fetch_work(&conn, pool, protocol, true).await {
            Err(ProtocolError::ProtocolMismatch(reason))
                if protocol == Protocol::GetBlockTemplate =>
            {
                debug!(pool = pool.number(), %reason, "No block template support, using getwork.");
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
            debug!(pool = pool.number(), error = %e, "Pool test failed.");
            return false;
        }
    };
    pool.state().record_getwork_rtt(started.elapsed());
    match ctx.work_from_raw(pool, raw) {
        Ok(mut work) => {
            ctx.test_work_current(&mut work);
            ctx.stage_work(work);
            true
        }
        Err(e) => {
            warn!(pool = pool.number(), error = %e, "Pool test returned unusable work.");
            false
        }
    }
}

/// Mark `pool` down and move off it if it is current.
pub fn pool_died(ctx: &MiningContext, pool: &Arc<Pool>) {
    let newly_down = {
        let mut state = pool.state();
        let newly_down = !state.liveness.is_down();
        if newly_down {
            state.liveness = if state.liveness == Liveness::Alive {
                Liveness::Idle
            } else {
                Liveness::Dead
            };
            state.alive_since = None;
        }
        state.idle_since = Some(Instant::now());
        newly_down
    };
    if !newly_down {
        return;
    }

    warn!(pool = pool.number(), url = %pool.url(), "Pool not responding.");
    if ctx.pools.is_current(pool) {
        ctx.switch_pools(None);
    }
}

/// Mark `pool` alive again.
///
/// Under failover with no fail-switch delay a better pool is switched back
/// to at once; otherwise the watcher does it once the pool has been stable.
pub fn pool_resus(ctx: &MiningContext, pool: &Arc<Pool>) {
    let was_down = {
        let mut state = pool.state();
        let was_down = state.liveness.is_down();
        state.liveness = Liveness::Alive;
        state.seq_getfails = 0;
        state.idle_since = None;
        if was_down || state.alive_since.is_none() {
            state.alive_since = Some(Instant::now());
        }
        was_down
    };
    if was_down {
        info!(pool = pool.number(), url = %pool.url(), "Pool alive again.");
    }

    let current_down = ctx.pools.current().is_none_or(|cp| !cp.is_workable());
    let immediate =
        ctx.pools.strategy() == Strategy::Failover && ctx.config.fail_switch_delay().is_zero();
    if current_down || immediate {
        ctx.switch_pools(None);
    }
}

/// Periodic pool maintenance until shutdown.
pub async fn watcher(ctx: Arc<MiningContext>) {
    let mut interval = tokio::time::interval(WATCH_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = ctx.shutdown.cancelled() => break,
        }
        watch_once(&ctx).await;
    }
    debug!("Pool watcher stopped.");
}

pub(crate) async fn watch_once(ctx: &MiningContext) {
    for pool in ctx.pools.pools() {
        let reaped = pool.connections.reap();
        if reaped > 0 {
            trace!(pool = pool.number(), reaped, "Reaped idle connections.");
        }

        let due = {
            let state = pool.state();
            state.enabled == PoolEnableState::Enabled
                && !state.removed
                && (state.liveness == Liveness::Untested
                    || (state.liveness.is_down()
                        && state.idle_since.is_none_or(|t| t.elapsed() >= RETEST_AFTER)))
        };
        if !due {
            continue;
        }
        if pool_active(ctx, &pool, true).await {
            pool_resus(ctx, &pool);
        } else {
            pool_died(ctx, &pool);
        }
    }

    if ctx.pools.take_rotate_due()
        && let Some(next) = ctx.pools.next_after_current()
    {
        info!(pool = next.number(), "Rotating pools.");
        ctx.switch_pools(Some(&next));
    }

    fail_back(ctx);
}

/// Under failover, return to the best pool once it has been up for the
/// fail-switch delay.
fn fail_back(ctx: &MiningContext) {
    let delay = ctx.config.fail_switch_delay();
    if ctx.pools.strategy() != Strategy::Failover || delay.is_zero() {
        return;
    }
    let Some(current) = ctx.pools.current() else {
        return;
    };
    let Some(top) = ctx
        .pools
        .priority_order()
        .into_iter()
        .find(|p| p.is_workable())
    else {
        return;
    };
    if same_pool(&top, &current) {
        return;
    }

    let (top_prio, stable) = {
        let state = top.state();
        (
            state.prio,
            state.liveness == Liveness::Alive
                && state.alive_since.is_some_and(|t| t.elapsed() >= delay),
        )
    };
    let current_prio = current.state().prio;
    if stable && top_prio < current_prio {
        info!(pool = top.number(), "Pool stable again, switching back.");
        ctx.switch_pools(None);
    }
}
