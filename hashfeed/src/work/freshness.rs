//! Staleness and block-change detection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{MAX_ROLLS, Work, header};
use crate::config::MinerConfig;
use crate::context::MiningContext;
use crate::goal::BlockChange;
use crate::pool::{Pool, Protocol, Strategy};
use crate::stats::ShareCounters;
use crate::tracing::prelude::*;

/// Floor for the expiry window after subtracting pool latency.
const MIN_EXPIRY: Duration = Duration::from_secs(5);

/// A view of the pool set for staleness decisions.
pub struct StaleCheck<'a> {
    pub config: &'a MinerConfig,
    pub current: Option<Arc<Pool>>,
    pub strategy: Strategy,
    pub enabled_pools: usize,
}

impl StaleCheck<'_> {
    fn is_current(&self, pool: &Arc<Pool>) -> bool {
        self.current.as_ref().is_some_and(|cp| Arc::ptr_eq(cp, pool))
    }

    pub fn is_stale(&self, work: &Work, share: bool) -> bool {
        if self.config.benchmark {
            return false;
        }
        let pool = &work.pool;

        if self.config.fail_only
            && !share
            && !work.mandatory
            && !self.is_current(pool)
            && !self.strategy.is_multi_pool()
        {
            trace!(work_id = work.id(), "Work stale due to fail-only pool mismatch.");
            return true;
        }

        let block_id = work.block_id();
        let push_notify = pool.has_push_notify();
        let goal_block = pool.goal().blockchain.current_block_id();
        let job_moved = share
            && work.stratum_binding().is_some_and(|binding| {
                pool.stratum
                    .read()
                    .job
                    .as_ref()
                    .is_none_or(|job| job.job_id != binding.job_id)
            });

        let state = pool.state();
        if share {
            if state.block_id != 0 && state.block_id != block_id {
                trace!(work_id = work.id(), "Share stale, pool moved to a new block.");
                return true;
            }
            if !state.submit_old && work.work_restart_id != state.work_restart_id {
                trace!(work_id = work.id(), "Share stale, pool restarted work.");
                return true;
            }
            if job_moved {
                trace!(work_id = work.id(), "Share stale, stratum job replaced.");
                return true;
            }
        } else {
            let single_pool = self.enabled_pools <= 1 || self.config.fail_only;
            let block_moved = if single_pool {
                state.block_id != 0 && state.block_id != block_id
            } else {
                goal_block.is_some_and(|current| current != block_id)
            };
            if block_moved {
                trace!(work_id = work.id(), "Work stale due to block mismatch.");
                return true;
            }
            if work.work_restart_id != state.work_restart_id {
                trace!(work_id = work.id(), "Work stale, pool restarted work.");
                return true;
            }
        }

        let base = if push_notify {
            self.config.expiry_lp()
        } else {
            self.config.expiry()
        };
        let window = work
            .rolltime
            .map_or(base, |rolltime| rolltime.min(base))
            .saturating_sub(state.work_delay())
            .max(MIN_EXPIRY);
        if work.staged.elapsed() >= window {
            trace!(work_id = work.id(), "Work stale due to expiry.");
            return true;
        }
        false
    }

    /// Whether time rolling is allowed at all for this work.
    pub fn can_roll(&self, work: &Work) -> bool {
        work.protocol != Protocol::Stratum
            && work.is_rollable()
            && work.rolls < MAX_ROLLS
            && !self.is_stale(work, false)
    }

    /// Whether rolling is worthwhile: the work's pool is in use and enough
    /// of its window is left to be worth a share.
    pub fn should_roll(&self, work: &Work) -> bool {
        if !self.is_current(&work.pool) && !self.strategy.is_multi_pool() {
            return false;
        }
        let window = work
            .rolltime
            .unwrap_or_default()
            .max(self.config.scantime())
            * 2
            / 3;
        work.staged.elapsed() <= window
    }
}

impl MiningContext {
    pub fn stale_check(&self) -> StaleCheck<'_> {
        StaleCheck {
            config: &self.config,
            current: self.pools.current(),
            strategy: self.pools.strategy(),
            enabled_pools: self.pools.enabled_count(),
        }
    }

    pub fn is_stale(&self, work: &Work, share: bool) -> bool {
        self.stale_check().is_stale(work, share)
    }

    /// Record the block a fresh work item builds on.
    ///
    /// Returns false when this work revealed a block never seen before for
    /// its goal, true when the block was already known. A new block other
    /// than the very first of the run restarts all mining. A longpoll or
    /// clean-job notification on a known block bumps the pool's restart
    /// generation and restarts mining if the pool is current. Mandatory
    /// work is exempt and leaves everything untouched.
    pub fn test_work_current(&self, work: &mut Work) -> bool {
        if work.mandatory {
            return false;
        }
        let pool = work.pool.clone();
        let goal = pool.goal().clone();
        let block_id = work.block_id();

        match goal.blockchain.offer(work.prev_hash(), work.height) {
            BlockChange::New { record, first } => {
                goal.note_new_block(&record);
                goal.set_network_bits(header::bits(&work.header));
                ShareCounters::bump(&self.stats.new_blocks);
                {
                    let mut state = pool.state();
                    state.block_id = block_id;
                    state.work_restart_time = Some(Instant::now());
                }
                if first {
                    debug!(goal = %goal.name(), "First block of the run.");
                    return false;
                }
                if work.longpoll {
                    info!(pool = pool.number(), "Longpoll from pool detected new block.");
                } else if pool.has_push_notify() {
                    info!(pool = pool.number(), "New block detected on network before pool notification.");
                } else {
                    info!(pool = pool.number(), "New block detected on network.");
                }
                self.restart_threads();
                false
            }
            BlockChange::Known => {
                let is_current = self.pools.is_current(&pool);
                let restart = {
                    let mut state = pool.state();
                    if state.block_id != block_id {
                        debug!(pool = pool.number(), "Pool caught up to a known block.");
                        state.block_id = block_id;
                        state.work_restart_time = Some(Instant::now());
                    }
                    if work.longpoll {
                        state.work_restart_id = state.work_restart_id.wrapping_add(1);
                        work.work_restart_id = state.work_restart_id;
                    }
                    work.longpoll && is_current
                };
                if work.longpoll {
                    info!(pool = pool.number(), "Pool requested work restart.");
                }
                if restart {
                    self.restart_threads();
                }
                true
            }
        }
    }

    /// Tell every device to drop what it is hashing and fetch fresh work.
    pub fn restart_threads(&self) {
        // Mark current lagging so the scheduler refills without complaint
        if let Some(cp) = self.pools.current() {
            cp.state().lagging = true;
        }
        let check = self.stale_check();
        self.queue.prune_stale(|w| check.is_stale(w, false));
        self.restart.send_modify(|generation| *generation += 1);
    }

    /// We found a block. Its hash is the previous-block hash of everything
    /// that follows, so record it as the new tip now instead of waiting for
    /// a pool to tell us.
    pub fn mark_local_solution(&self, work: &Work) {
        let goal = work.pool.goal();
        let block_hash = header::hash(&work.header);
        let height = if work.height > 0 { work.height + 1 } else { 0 };
        if let BlockChange::New { record, .. } = goal.blockchain.offer(block_hash, height) {
            goal.note_new_block(&record);
            ShareCounters::bump(&self.stats.new_blocks);
            self.restart_threads();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::block_id_of;
    use crate::goal::Algorithm;
    use crate::test_support::{context_with, test_config, test_context, work_on};
    use crate::work::staging::DeviceCapability;
    use crate::work::template::BlockTemplate;

    #[tokio::test(start_paused = true)]
    async fn test_rolltime_bounds_expiry() {
        let mut config = test_config(1);
        config.expiry_secs = 600;
        let ctx = context_with(config);
        let pool = ctx.pools.pool(0).unwrap();
        let mut work = work_on(&ctx, &pool, [1u8; 32]);
        work.rolltime = Some(Duration::from_secs(120));

        assert!(!ctx.is_stale(&work, false));
        tokio::time::advance(Duration::from_secs(118)).await;
        assert!(!ctx.is_stale(&work, false));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(ctx.is_stale(&work, false), "121s old with a 120s rolltime");
        assert!(ctx.is_stale(&work, false), "staleness does not revert");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_floor_for_slow_pools() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        pool.state().getwork_rtt = 100.0;
        let work = work_on(&ctx, &pool, [1u8; 32]);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!ctx.is_stale(&work, false));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ctx.is_stale(&work, false));
    }

    #[tokio::test]
    async fn test_same_block_from_second_pool() {
        let ctx = test_context(2);
        let a = ctx.pools.pool(0).unwrap();
        let b = ctx.pools.pool(1).unwrap();

        let mut first = work_on(&ctx, &a, [9u8; 32]);
        assert!(!ctx.test_work_current(&mut first));
        assert_eq!(a.goal().blockchain.len(), 1);

        let mut second = work_on(&ctx, &b, [9u8; 32]);
        assert!(ctx.test_work_current(&mut second));
        assert_eq!(b.state().block_id, block_id_of(&[9u8; 32]));
        assert!(b.state().work_restart_time.is_some());
        assert_eq!(a.goal().blockchain.len(), 1);
    }

    #[tokio::test]
    async fn test_new_block_restarts_after_the_first() {
        let ctx = test_context(2);
        let pool = ctx.pools.pool(0).unwrap();
        let restart = ctx.subscribe_restart();

        let mut first = work_on(&ctx, &pool, [1u8; 32]);
        ctx.test_work_current(&mut first);
        ctx.stage_work(first);
        assert_eq!(*restart.borrow(), 0, "startup block does not restart");

        let mut next = work_on(&ctx, &pool, [2u8; 32]);
        assert!(!ctx.test_work_current(&mut next));
        assert_eq!(*restart.borrow(), 1);
        assert!(ctx.queue.is_empty(), "old-block work pruned");
        assert_eq!(ctx.stats.new_blocks.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_mandatory_work_does_not_register_block() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        let restart = ctx.subscribe_restart();
        let mut base = work_on(&ctx, &pool, [1u8; 32]);
        ctx.test_work_current(&mut base);

        let mut forced = work_on(&ctx, &pool, [2u8; 32]);
        forced.mandatory = true;
        forced.longpoll = true;
        assert!(!ctx.test_work_current(&mut forced));
        assert_eq!(pool.goal().blockchain.len(), 1);
        assert_eq!(pool.state().block_id, block_id_of(&[1u8; 32]));
        assert_eq!(pool.state().work_restart_id, 0);
        assert_eq!(*restart.borrow(), 0);
    }

    #[tokio::test]
    async fn test_longpoll_on_known_block_bumps_restart_id() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        let restart = ctx.subscribe_restart();

        let mut base = work_on(&ctx, &pool, [1u8; 32]);
        ctx.test_work_current(&mut base);
        let older = work_on(&ctx, &pool, [1u8; 32]);
        assert!(!ctx.is_stale(&older, false));

        let mut lp = work_on(&ctx, &pool, [1u8; 32]);
        lp.longpoll = true;
        assert!(ctx.test_work_current(&mut lp));
        assert_eq!(pool.state().work_restart_id, 1);
        assert_eq!(lp.work_restart_id, 1);
        assert_eq!(*restart.borrow(), 1, "current pool restarts");

        assert!(ctx.is_stale(&older, false));
        assert!(!ctx.is_stale(&lp, false));
        assert!(ctx.is_stale(&older, true), "share from before restart");
        pool.state().submit_old = true;
        assert!(!ctx.is_stale(&older, true), "pool accepts old shares");
    }

    #[tokio::test]
    async fn test_fail_only_rejects_other_pools() {
        let mut config = test_config(2);
        config.fail_only = true;
        let ctx = context_with(config);
        let backup = ctx.pools.pool(1).unwrap();

        let mut work = work_on(&ctx, &backup, [1u8; 32]);
        assert!(ctx.is_stale(&work, false));
        assert!(!ctx.is_stale(&work, true), "shares are judged on their block");
        work.mandatory = true;
        assert!(!ctx.is_stale(&work, false));
    }

    #[tokio::test]
    async fn test_share_on_old_pool_block_is_stale() {
        let ctx = test_context(2);
        let pool = ctx.pools.pool(0).unwrap();
        let share = work_on(&ctx, &pool, [1u8; 32]);
        pool.state().block_id = block_id_of(&[2u8; 32]);
        assert!(ctx.is_stale(&share, true));
    }

    #[tokio::test]
    async fn test_benchmark_never_stale() {
        let mut config = test_config(1);
        config.benchmark = true;
        let ctx = context_with(config);
        let pool = ctx.pools.pool(0).unwrap();
        let work = work_on(&ctx, &pool, [1u8; 32]);
        pool.state().work_restart_id = 5;
        assert!(!ctx.is_stale(&work, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_roll_decisions() {
        let ctx = test_context(2);
        let current = ctx.pools.pool(0).unwrap();
        let backup = ctx.pools.pool(1).unwrap();

        let mut work = work_on(&ctx, &current, [1u8; 32]);
        assert!(!ctx.stale_check().can_roll(&work), "no rolltime");
        work.rolltime = Some(Duration::from_secs(90));
        assert!(ctx.stale_check().can_roll(&work));
        assert!(ctx.stale_check().should_roll(&work));

        let clone = work.make_clone(&ctx.ids);
        assert!(!ctx.stale_check().can_roll(&clone));

        let mut other = work_on(&ctx, &backup, [1u8; 32]);
        other.rolltime = Some(Duration::from_secs(90));
        assert!(!ctx.stale_check().should_roll(&other), "not the current pool");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!ctx.stale_check().should_roll(&work), "past two thirds of the window");
    }

    fn template(time_mutable: bool) -> Arc<BlockTemplate> {
        Arc::new(BlockTemplate::new(
            0x2000_0000,
            [3u8; 32],
            0x1d00ffff,
            1_700_000_000,
            800_000,
            bitcoin::pow::Target::MAX,
            vec![1, 2, 3],
            vec![],
            time_mutable,
            Some(Duration::from_secs(60)),
        ))
    }

    #[tokio::test]
    async fn test_template_work_never_time_rolled() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();

        let fixed = Work::from_template(&ctx.ids, pool.clone(), &template(false)).unwrap();
        assert!(!ctx.stale_check().can_roll(&fixed), "pool fixed the time field");

        let mutable = Work::from_template(&ctx.ids, pool, &template(true)).unwrap();
        assert!(!ctx.stale_check().can_roll(&mutable));
    }

    #[tokio::test]
    async fn test_template_work_popped_whole() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();
        let device = ctx
            .devices
            .register("dev0", DeviceCapability::new(Algorithm::Sha256d), 2);
        let tmpl = template(true);

        let first = Work::from_template(&ctx.ids, pool.clone(), &tmpl).unwrap();
        let first_id = first.id();
        ctx.stage_work(first);
        let popped = ctx.pop_work(&device).await.unwrap();
        assert_eq!(popped.id(), first_id, "handed out as is, not cloned");
        assert_eq!(popped.rolls, 0);
        assert!(ctx.queue.is_empty());

        let second = Work::from_template(&ctx.ids, pool, &tmpl).unwrap();
        assert_ne!(popped.header, second.header, "each header covers its own nonce space");
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_is_monotonic() {
        let ctx = test_context(1);
        let pool = ctx.pools.pool(0).unwrap();

        let restarted = work_on(&ctx, &pool, [1u8; 32]);
        assert!(!ctx.is_stale(&restarted, false));
        pool.state().work_restart_id = 1;
        let expiring = work_on(&ctx, &pool, [1u8; 32]);

        for _ in 0..5 {
            assert!(ctx.is_stale(&restarted, false));
            assert!(ctx.is_stale(&restarted, true));
            tokio::time::advance(Duration::from_secs(30)).await;
        }
        assert!(ctx.is_stale(&expiring, false), "150s is past the default expiry");
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert!(ctx.is_stale(&expiring, false));
            assert!(ctx.is_stale(&restarted, false));
        }
    }
}
