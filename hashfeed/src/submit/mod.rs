//! Share submission.
//!
//! Devices hand shares over with [`MiningContext::submit_async`]. A single
//! worker task receives them and drives every submission concurrently in a
//! `FuturesUnordered`, so one slow pool never holds up another.
//!
//! Every share handed over is settled exactly once with a
//! [`SubmitOutcome`], which updates the counters and releases the share's
//! in-flight slot.

pub mod dedup;
pub mod pending;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;

use crate::context::{DisableReason, MiningContext};
use crate::goal::Algorithm;
use crate::pool::{Pool, PoolEnableState, Protocol};
use crate::stats::ShareCounters;
use crate::tracing::prelude::*;
use crate::work::Work;
use crate::work::header;
use crate::work::stratum::StratumSubmit;

/// Stale shares stop being retried after this long, even when retries are
/// unlimited.
const STALE_RETRY_WINDOW: Duration = Duration::from_secs(300);

/// How often the drain checks for outstanding stratum replies.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Final result of one share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Rejected by the pool, with its reason if it gave one.
    Rejected(Option<String>),
    /// Went stale before it could be usefully submitted.
    Stale,
    /// Already submitted, or bound to a session that no longer exists.
    Duplicate,
    /// Could not be delivered.
    Failed,
}

/// Run the submission worker until shutdown, then drain.
pub async fn worker(ctx: Arc<MiningContext>) {
    let Some(mut rx) = ctx.take_submit_receiver() else {
        error!("Submission worker already running.");
        return;
    };

    let mut inflight = FuturesUnordered::new();
    loop {
        tokio::select! {
            share = rx.recv() => match share {
                Some(share) => inflight.push(submit_one(ctx.clone(), share)),
                None => break,
            },
            Some(()) = inflight.next(), if !inflight.is_empty() => {}
            _ = ctx.shutdown.cancelled() => break,
        }
    }

    while let Ok(share) = rx.try_recv() {
        inflight.push(submit_one(ctx.clone(), share));
    }
    let outstanding = inflight.len() + ctx.pending.len();
    if outstanding > 0 {
        info!(outstanding, "Draining share submissions.");
    }
    let drained = tokio::time::timeout(ctx.config.drain_timeout(), async {
        while inflight.next().await.is_some() {}
        while !ctx.pending.is_empty() {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            undelivered = ctx.stats.in_flight(),
            "Exiting with undelivered share submissions."
        );
    }
    debug!("Submission worker stopped.");
}

fn is_block(share: &Work) -> bool {
    share.algorithm() == Algorithm::Sha256d
        && header::meets_target(&share.header, header::network_target(&share.header))
}

pub(crate) async fn submit_one(ctx: Arc<MiningContext>, share: Work) {
    if is_block(&share) {
        found_block(&ctx, &share);
    }

    if ctx.config.benchmark {
        let outcome = if ctx.dedup.check(header::hash(&share.header)) {
            SubmitOutcome::Duplicate
        } else {
            SubmitOutcome::Accepted
        };
        record_outcome(&ctx, share, outcome);
        return;
    }

    match share.protocol {
        Protocol::Stratum => submit_stratum(&ctx, share).await,
        Protocol::GetWork | Protocol::GetBlockTemplate => submit_http(&ctx, share).await,
    }
}

/// Record a solved block and hand it to every direct-submission pool on
/// tasks of its own. The share's normal submission does not wait for them.
fn found_block(ctx: &Arc<MiningContext>, share: &Work) {
    ShareCounters::bump(&ctx.stats.found_blocks);
    info!(
        pool = share.pool.number(),
        height = share.height,
        work_id = share.id(),
        "Found block."
    );
    ctx.mark_local_solution(share);

    let Some(template) = share.template() else {
        return;
    };
    let targets: Vec<Arc<Pool>> = ctx
        .pools
        .pools()
        .into_iter()
        .filter(|p| p.state().direct_block_submit)
        .collect();
    if targets.is_empty() {
        return;
    }
    let block = Arc::new(template.block_bytes(&share.header));
    for pool in targets {
        let task_ctx = ctx.clone();
        let block = block.clone();
        ctx.tasks.spawn(async move {
            submit_block_direct(&task_ctx, &pool, &block).await;
        });
    }
}

async fn submit_block_direct(ctx: &MiningContext, pool: &Arc<Pool>, block: &[u8]) {
    let conn = match pool.connections.pop(ctx.connection_cap(), pool.proxy()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(pool = pool.number(), error = %e, "No connection for direct block submission.");
            return;
        }
    };
    let result = ctx.client.submit_block(&conn, pool, block).await;
    pool.connections.push(conn);
    match result {
        Ok(reply) if reply.accepted => info!(pool = pool.number(), "Block submitted directly."),
        Ok(reply) => warn!(
            pool = pool.number(),
            reason = reply.reason.as_deref().unwrap_or("none given"),
            "Direct block submission rejected."
        ),
        Err(e) => warn!(pool = pool.number(), error = %e, "Direct block submission failed."),
    }
}

fn note_remote_failure(ctx: &MiningContext, pool: &Pool) {
    ShareCounters::bump(&ctx.stats.shares.remote_failures);
    ShareCounters::bump(&pool.stats.remote_failures);
    pool.state().submit_fail = true;
}

/// Whether a stale share should still go upstream.
fn wants_stale(ctx: &MiningContext, pool: &Pool) -> bool {
    ctx.config.submit_stale || pool.state().submit_old
}

async fn submit_http(ctx: &MiningContext, share: Work) {
    let pool = share.pool.clone();
    let mut failures: i32 = 0;
    let mut stale_since: Option<Instant> = None;

    loop {
        if ctx.is_stale(&share, true) {
            if !wants_stale(ctx, &pool) {
                debug!(pool = pool.number(), work_id = share.id(), "Share stale, not submitting.");
                record_outcome(ctx, share, SubmitOutcome::Stale);
                return;
            }
            let since = *stale_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= STALE_RETRY_WINDOW {
                debug!(pool = pool.number(), work_id = share.id(), "Stale share retry window over.");
                record_outcome(ctx, share, SubmitOutcome::Stale);
                return;
            }
        }

        let result = match pool.connections.pop(ctx.connection_cap(), pool.proxy()).await {
            Ok(conn) => {
                let result = ctx.client.submit_work(&conn, &pool, &share).await;
                pool.connections.push(conn);
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => {
                pool.state().submit_fail = false;
                let outcome = if reply.accepted {
                    SubmitOutcome::Accepted
                } else {
                    SubmitOutcome::Rejected(reply.reason)
                };
                record_outcome(ctx, share, outcome);
                return;
            }
            Err(e) => {
                note_remote_failure(ctx, &pool);
                failures += 1;
                let retries = ctx.config.retries;
                if (retries >= 0 && failures > retries) || ctx.shutdown.is_cancelled() {
                    warn!(pool = pool.number(), error = %e, failures, "Share submission failed, giving up.");
                    record_outcome(ctx, share, SubmitOutcome::Failed);
                    return;
                }
                warn!(pool = pool.number(), error = %e, failures, "Share submission failed, retrying.");
                tokio::time::sleep(ctx.config.fail_pause()).await;
            }
        }
    }
}

async fn submit_stratum(ctx: &MiningContext, share: Work) {
    let pool = share.pool.clone();
    let Some(binding) = share.stratum_binding().cloned() else {
        warn!(work_id = share.id(), "Stratum share without a job binding.");
        record_outcome(ctx, share, SubmitOutcome::Failed);
        return;
    };

    let same_session = pool.stratum.read().nonce1 == binding.nonce1;
    if !same_session {
        debug!(pool = pool.number(), work_id = share.id(), "Share from a previous stratum session.");
        record_outcome(ctx, share, SubmitOutcome::Duplicate);
        return;
    }
    if ctx.is_stale(&share, true) && !wants_stale(ctx, &pool) {
        debug!(pool = pool.number(), work_id = share.id(), "Share stale, not submitting.");
        record_outcome(ctx, share, SubmitOutcome::Stale);
        return;
    }

    let submit = StratumSubmit::for_work(&share, &binding);
    let share_id = ctx.pending.insert(share);
    trace!(pool = pool.number(), share_id, job_id = %submit.job_id, "Submitting share.");

    if let Err(e) = ctx.stratum.submit(&pool, share_id, &submit).await {
        note_remote_failure(ctx, &pool);
        match ctx.pending.take(share_id) {
            Some(share) => {
                warn!(pool = pool.number(), error = %e, "Stratum share send failed.");
                record_outcome(ctx, share, SubmitOutcome::Failed);
            }
            None => debug!(share_id, "Share already settled by a disconnect."),
        }
    }
}

/// Settle a share: update counters and release its in-flight slot.
fn record_outcome(ctx: &MiningContext, share: Work, outcome: SubmitOutcome) {
    let pool = &share.pool;
    let device = share.device.and_then(|id| ctx.devices.get(id));
    let mut counters: Vec<&ShareCounters> = vec![&ctx.stats.shares, &pool.stats];
    if let Some(device) = &device {
        counters.push(&device.stats);
    }
    let difficulty = share.difficulty.as_f64();

    match &outcome {
        SubmitOutcome::Accepted => {
            counters.iter().for_each(|c| c.add_accepted(difficulty));
            pool.goal().stats.add_accepted(difficulty);
            let rejecting = {
                let mut state = pool.state();
                state.seq_rejects = 0;
                state.enabled == PoolEnableState::Rejecting
            };
            info!(
                pool = pool.number(),
                work_id = share.id(),
                difficulty = share.share_difficulty,
                "Accepted share."
            );
            if rejecting {
                info!(pool = pool.number(), "Pool accepting shares again.");
                if let Err(e) = ctx.set_pool_enabled(pool) {
                    warn!(error = %e, "Could not re-enable pool.");
                }
            }
        }
        SubmitOutcome::Rejected(reason) => {
            counters.iter().for_each(|c| c.add_rejected(difficulty));
            warn!(
                pool = pool.number(),
                work_id = share.id(),
                reason = reason.as_deref().unwrap_or("none given"),
                "Rejected share."
            );
            if !ctx.is_stale(&share, true) {
                let seq_rejects = {
                    let mut state = pool.state();
                    state.seq_rejects += 1;
                    state.seq_rejects
                };
                let enabled = pool.state().enabled == PoolEnableState::Enabled;
                if ctx.config.disable_rejecting_pools
                    && enabled
                    && seq_rejects > ctx.config.reject_threshold
                    && ctx.pools.len() > 1
                {
                    warn!(pool = pool.number(), seq_rejects, "Pool rejecting too many shares.");
                    if let Err(e) = ctx.set_pool_disabled(pool, DisableReason::Rejecting) {
                        warn!(error = %e, "Could not disable rejecting pool.");
                    }
                }
            }
        }
        SubmitOutcome::Stale => {
            counters.iter().for_each(|c| ShareCounters::bump(&c.stale));
            debug!(pool = pool.number(), work_id = share.id(), "Stale share.");
        }
        SubmitOutcome::Duplicate => {
            counters.iter().for_each(|c| ShareCounters::bump(&c.duplicates));
            debug!(pool = pool.number(), work_id = share.id(), "Duplicate share.");
        }
        SubmitOutcome::Failed => {}
    }

    if matches!(outcome, SubmitOutcome::Accepted | SubmitOutcome::Rejected(_)) {
        if ctx.stats.shares.offer_best(share.share_difficulty) {
            info!(difficulty = share.share_difficulty, "New best share.");
        }
        pool.stats.offer_best(share.share_difficulty);
        if let Some(device) = &device {
            device.stats.offer_best(share.share_difficulty);
        }
    }

    ctx.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
}

impl MiningContext {
    /// The stratum layer got the pool's answer to share `share_id`.
    pub fn on_stratum_reply(&self, share_id: u64, accepted: bool, reason: Option<String>) {
        match self.pending.take(share_id) {
            Some(share) => {
                let outcome = if accepted {
                    SubmitOutcome::Accepted
                } else {
                    SubmitOutcome::Rejected(reason)
                };
                record_outcome(self, share, outcome);
            }
            None => debug!(share_id, "Reply for unknown share."),
        }
    }

    /// Settle shares still waiting on a reply from `pool`. Resumable
    /// sessions get them sent again; otherwise they count as stale.
    pub fn clear_stratum_shares(&self, pool: &Arc<Pool>) {
        let shares = self.pending.take_for_pool(pool);
        if shares.is_empty() {
            return;
        }
        if self.stratum.resumable(pool) {
            info!(pool = pool.number(), count = shares.len(), "Resubmitting shares after disconnect.");
            for share in shares {
                self.resubmit(share);
            }
        } else {
            warn!(pool = pool.number(), count = shares.len(), "Discarding shares awaiting reply.");
            for share in shares {
                record_outcome(self, share, SubmitOutcome::Stale);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolError, RawReply};
    use crate::test_support::{
        MockClient, MockTransport, mock_context, stratum_job, test_config, work_on,
    };
    use crate::work::header::Header;
    use crate::work::stratum::gen_stratum_work;
    use crate::work::template::BlockTemplate;
    use bitcoin::pow::Target;

    fn stratum_share(ctx: &MiningContext, pool: &Arc<Pool>) -> Work {
        ctx.on_stratum_subscribed(pool, vec![0xab], 4, Some("s1".into()))
            .unwrap();
        ctx.on_stratum_notify(pool, stratum_job("j1", [5u8; 32], false));
        let work = gen_stratum_work(pool, &ctx.ids).unwrap();
        let share = work.for_share(&ctx.ids, 42, None);
        ctx.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        share
    }

    fn counted_share(ctx: &MiningContext, pool: &Arc<Pool>) -> Work {
        ctx.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        work_on(ctx, pool, [1u8; 32]).for_share(&ctx.ids, 7, None)
    }

    fn setup(
        config: crate::config::MinerConfig,
    ) -> (Arc<MiningContext>, Arc<MockClient>, Arc<MockTransport>, Arc<Pool>) {
        let (ctx, client, transport) = mock_context(config);
        let pool = ctx.pools.pool(0).unwrap();
        (ctx, client, transport, pool)
    }

    #[tokio::test]
    async fn test_stratum_send_failure_rolls_back() {
        let (ctx, _, transport, pool) = setup(test_config(1));
        transport.fail.store(true, Ordering::Relaxed);
        let share = stratum_share(&ctx, &pool);

        submit_one(ctx.clone(), share).await;

        assert!(ctx.pending.is_empty());
        assert_eq!(ctx.stats.in_flight(), 0);
        assert_eq!(pool.stats.snapshot().remote_failures, 1);
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_send_settles_once() {
        let (ctx, _, transport, pool) = setup(test_config(1));
        transport.fail.store(true, Ordering::Relaxed);
        transport.hold.store(true, Ordering::Relaxed);
        let share = stratum_share(&ctx, &pool);

        let send = tokio::spawn(submit_one(ctx.clone(), share));
        while ctx.pending.is_empty() {
            tokio::task::yield_now().await;
        }

        ctx.on_stratum_disconnect(&pool);
        assert!(ctx.pending.is_empty());
        assert_eq!(ctx.stats.in_flight(), 0);

        transport.release.notify_one();
        send.await.unwrap();
        assert_eq!(ctx.stats.in_flight(), 0, "settled exactly once");
        assert_eq!(ctx.stats.shares.snapshot().stale, 1);
    }

    #[tokio::test]
    async fn test_disconnect_resubmits_when_resumable() {
        let (ctx, _, transport, pool) = setup(test_config(1));
        transport.resumable.store(true, Ordering::Relaxed);
        let share = stratum_share(&ctx, &pool);
        let mut rx = ctx.take_submit_receiver().unwrap();

        submit_one(ctx.clone(), share).await;
        assert_eq!(ctx.pending.len(), 1);

        ctx.clear_stratum_shares(&pool);
        assert!(ctx.pending.is_empty());
        assert!(rx.try_recv().is_ok(), "share sent through the pipeline again");
        assert_eq!(ctx.stats.in_flight(), 1, "still counted once");
    }

    #[tokio::test]
    async fn test_reply_correlation() {
        let (ctx, _, transport, pool) = setup(test_config(1));
        let share = stratum_share(&ctx, &pool);
        submit_one(ctx.clone(), share).await;

        let (share_id, submit) = transport.sent.lock()[0].clone();
        assert_eq!(submit.job_id, "j1");
        assert_eq!(submit.nonce, 42);

        ctx.on_stratum_reply(share_id, true, None);
        ctx.on_stratum_reply(share_id, true, None);
        assert_eq!(pool.stats.snapshot().accepted, 1);
        assert_eq!(ctx.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_share_from_old_session_is_duplicate() {
        let (ctx, _, transport, pool) = setup(test_config(1));
        let share = stratum_share(&ctx, &pool);
        ctx.on_stratum_subscribed(&pool, vec![0xcd], 4, Some("s2".into()))
            .unwrap();

        submit_one(ctx.clone(), share).await;
        assert!(transport.sent.lock().is_empty());
        assert_eq!(ctx.stats.shares.snapshot().duplicates, 1);
        assert_eq!(ctx.stats.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_retry_then_accept() {
        let (ctx, client, _, pool) = setup(test_config(1));
        client.push_submit(Err(ProtocolError::Network("reset".into())));
        client.push_submit(Ok(RawReply::accepted()));

        submit_one(ctx.clone(), counted_share(&ctx, &pool)).await;
        let snap = pool.stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.remote_failures, 1);
        assert!(!pool.state().submit_fail);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_gives_up_after_retries() {
        let mut config = test_config(1);
        config.retries = 1;
        let (ctx, client, _, pool) = setup(config);
        client.push_submit(Err(ProtocolError::Timeout));
        client.push_submit(Err(ProtocolError::Timeout));
        client.push_submit(Ok(RawReply::accepted()));

        submit_one(ctx.clone(), counted_share(&ctx, &pool)).await;
        assert_eq!(pool.stats.snapshot().accepted, 0);
        assert_eq!(pool.stats.snapshot().remote_failures, 2);
        assert_eq!(ctx.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stale_share_kept_back() {
        let mut config = test_config(1);
        config.submit_stale = false;
        let (ctx, client, _, pool) = setup(config);
        let share = counted_share(&ctx, &pool);
        pool.state().block_id = crate::goal::block_id_of(&[2u8; 32]);

        submit_one(ctx.clone(), share).await;
        assert_eq!(client.submit_calls.load(Ordering::Relaxed), 0);
        assert_eq!(pool.stats.snapshot().stale, 1);
    }

    #[tokio::test]
    async fn test_rejecting_pool_disabled_and_restored() {
        let mut config = test_config(2);
        config.disable_rejecting_pools = true;
        config.reject_threshold = 2;
        let (ctx, client, _, pool) = setup(config);

        for _ in 0..3 {
            client.push_submit(Ok(RawReply::rejected("low difficulty")));
            submit_one(ctx.clone(), counted_share(&ctx, &pool)).await;
        }
        assert_eq!(pool.state().enabled, PoolEnableState::Rejecting);
        assert!(!ctx.pools.is_current(&pool));

        submit_one(ctx.clone(), counted_share(&ctx, &pool)).await;
        assert_eq!(pool.state().enabled, PoolEnableState::Enabled);
        assert_eq!(pool.state().seq_rejects, 0);
        assert!(ctx.pools.is_current(&pool));
        assert_eq!(pool.stats.snapshot().rejected, 3);
    }

    /// A share from regtest-difficulty template work that also solves a
    /// block. Returns it with its header.
    fn block_share(ctx: &MiningContext, pool: &Arc<Pool>) -> (Work, Header) {
        // Regtest bits: about every other hash is a block
        let template = Arc::new(BlockTemplate::new(
            0x2000_0000,
            [6u8; 32],
            0x207fffff,
            1_700_000_000,
            101,
            Target::MAX,
            vec![1, 2, 3],
            vec![],
            true,
            None,
        ));
        let work = Work::from_template(&ctx.ids, pool.clone(), &template).unwrap();
        let nonce = (0u32..)
            .find(|n| {
                let mut h = work.header;
                header::set_nonce(&mut h, *n);
                header::meets_target(&h, header::network_target(&h))
            })
            .unwrap();
        let share = work.for_share(&ctx.ids, nonce, None);
        let solved = share.header;
        ctx.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        (share, solved)
    }

    #[tokio::test]
    async fn test_found_block_goes_to_direct_pools() {
        let mut config = test_config(2);
        config.pools[1].direct_block_submit = true;
        let (ctx, client, _, pool) = setup(config);
        let (share, solved) = block_share(&ctx, &pool);
        let block_hash = header::hash(&solved);

        submit_one(ctx.clone(), share).await;
        ctx.tasks.close();
        ctx.tasks.wait().await;

        assert_eq!(ctx.stats.found_blocks.load(Ordering::Relaxed), 1);
        assert_eq!(client.blocks.lock().len(), 1);
        assert_eq!(&client.blocks.lock()[0][..80], &solved[..]);
        assert!(pool.goal().blockchain.contains(&block_hash));
        assert_eq!(pool.stats.snapshot().accepted, 1, "normal submission too");
    }

    #[tokio::test]
    async fn test_slow_block_submit_does_not_hold_share() {
        let mut config = test_config(2);
        config.pools[1].direct_block_submit = true;
        let (ctx, client, _, pool) = setup(config);
        client.hold_blocks.store(true, Ordering::Release);
        let (share, _) = block_share(&ctx, &pool);

        submit_one(ctx.clone(), share).await;
        assert_eq!(pool.stats.snapshot().accepted, 1);
        assert_eq!(ctx.stats.in_flight(), 0);

        while client.blocks.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats.snapshot().accepted, 1);
        client.release_blocks.notify_one();
        ctx.tasks.close();
        ctx.tasks.wait().await;
        assert_eq!(client.blocks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_benchmark_catches_duplicates() {
        let mut config = test_config(1);
        config.benchmark = true;
        let (ctx, client, _, pool) = setup(config);
        let work = work_on(&ctx, &pool, [1u8; 32]);

        for _ in 0..2 {
            ctx.stats.in_flight.fetch_add(1, Ordering::AcqRel);
            submit_one(ctx.clone(), work.for_share(&ctx.ids, 9, None)).await;
        }
        let snap = ctx.stats.shares.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(client.submit_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_worker_drains_on_shutdown() {
        let (ctx, _, _, pool) = setup(test_config(1));
        ctx.submit_async(work_on(&ctx, &pool, [1u8; 32]).for_share(&ctx.ids, 1, None));
        ctx.submit_async(work_on(&ctx, &pool, [1u8; 32]).for_share(&ctx.ids, 2, None));
        ctx.shutdown.cancel();

        worker(ctx.clone()).await;
        assert_eq!(ctx.stats.in_flight(), 0);
        assert_eq!(pool.stats.snapshot().accepted, 2);
    }
}
