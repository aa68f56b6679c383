//! Longpoll listeners.
//!
//! A pool that advertises a longpoll URL gets one listener task. It keeps a
//! long request open while the pool is in use and stages whatever comes
//! back as fresh work, which also makes block changes visible before the
//! next regular fetch.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::MiningContext;
use crate::pool::{Pool, PoolEnableState, Protocol};
use crate::protocol::RawWork;
use crate::tracing::prelude::*;

/// A longpoll that fails faster than this counts as a quick failure.
const QUICK_FAILURE: Duration = Duration::from_secs(30);

/// Pause after a quick failure before asking again.
const QUICK_FAILURE_PAUSE: Duration = Duration::from_secs(30);

/// Start the listener for `pool`. The caller must hold the claim from
/// [`MiningContext::claim_longpoll`].
pub fn spawn(ctx: &Arc<MiningContext>, pool: Arc<Pool>) {
    let Some(advertised) = pool.longpoll_url() else {
        pool.state().longpoll_running = false;
        return;
    };
    let url = resolve_url(pool.url(), &advertised);
    info!(pool = pool.number(), %url, "Starting longpoll.");

    let task_ctx = ctx.clone();
    ctx.tasks.spawn(async move {
        listen(&task_ctx, &pool, &url).await;
        pool.state().longpoll_running = false;
        debug!(pool = pool.number(), "Longpoll stopped.");
    });
}

/// Longpoll URLs may be relative to the pool URL.
pub fn resolve_url(pool_url: &str, longpoll: &str) -> String {
    reqwest::Url::parse(pool_url)
        .and_then(|base| base.join(longpoll))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| longpoll.to_string())
}

async fn listen(ctx: &MiningContext, pool: &Arc<Pool>, url: &str) {
    let mut quick_failures: i32 = 0;
    loop {
        if !wait_until_wanted(ctx, pool).await {
            return;
        }

        let conn = match pool.connections.pop(ctx.connection_cap(), pool.proxy()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(pool = pool.number(), error = %e, "No connection for longpoll.");
                if !pause(ctx, ctx.config.fail_pause()).await {
                    return;
                }
                continue;
            }
        };

        let started = Instant::now();
        let result = tokio::select! {
            result = ctx.client.longpoll(&conn, pool, url) => Some(result),
            _ = ctx.shutdown.cancelled() => None,
        };
        pool.connections.push(conn);
        let Some(result) = result else {
            return;
        };
        if pool.state().removed {
            return;
        }

        match result {
            Ok(raw) => {
                quick_failures = 0;
                deliver(ctx, pool, raw);
            }
            Err(e) if started.elapsed() < QUICK_FAILURE => {
                quick_failures += 1;
                let retries = ctx.config.retries;
                if retries >= 0 && quick_failures > retries {
                    warn!(pool = pool.number(), error = %e, "Longpoll keeps failing, giving up.");
                    return;
                }
                debug!(pool = pool.number(), error = %e, quick_failures, "Longpoll failed quickly.");
                if !pause(ctx, QUICK_FAILURE_PAUSE).await {
                    return;
                }
            }
            Err(e) => {
                quick_failures = 0;
                debug!(pool = pool.number(), error = %e, "Longpoll ended, reissuing.");
            }
        }
    }
}

/// Sleep unless shutting down. False on shutdown.
async fn pause(ctx: &MiningContext, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = ctx.shutdown.cancelled() => false,
    }
}

/// Wait until the pool's work is wanted: it is current, several pools are
/// in use, or it is rejecting and needs to show it recovered. False if the
/// pool was removed or the miner is shutting down.
async fn wait_until_wanted(ctx: &MiningContext, pool: &Arc<Pool>) -> bool {
    loop {
        let switched = ctx.pool_switched.notified();
        tokio::pin!(switched);
        switched.as_mut().enable();

        if ctx.shutdown.is_cancelled() {
            return false;
        }
        let (removed, rejecting) = {
            let state = pool.state();
            (state.removed, state.enabled == PoolEnableState::Rejecting)
        };
        if removed {
            return false;
        }
        if rejecting || ctx.pools.is_current(pool) || ctx.pools.strategy().is_multi_pool() {
            return true;
        }

        tokio::select! {
            _ = switched => {}
            _ = ctx.shutdown.cancelled() => return false,
        }
    }
}

/// Stage a longpoll reply, plus rolled copies of it to fill the queue when
/// the pool allows rolling.
fn deliver(ctx: &MiningContext, pool: &Arc<Pool>, raw: RawWork) {
    let mut work = match ctx.work_from_raw(pool, raw) {
        Ok(work) => work,
        Err(e) => {
            warn!(pool = pool.number(), error = %e, "Unusable longpoll reply.");
            return;
        }
    };
    work.longpoll = true;
    ctx.test_work_current(&mut work);
    debug!(pool = pool.number(), work_id = work.id(), "Longpoll delivered work.");

    let mut copies: Vec<_> = Vec::new();
    if work.is_rollable() && work.protocol == Protocol::GetWork {
        for _ in 0..ctx.config.queue {
            let copy = copies.last().unwrap_or(&work).rolled_copy(&ctx.ids);
            copies.push(copy);
        }
    }
    ctx.stage_work(work);
    for copy in copies {
        ctx.stage_work(copy);
    }
}
