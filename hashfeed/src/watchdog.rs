//! Periodic health checks.
//!
//! Drops staged work that went stale without a block change to flush it,
//! raises an alarm when no pool has been usable for a while, and reports
//! devices that stopped checking in.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::context::MiningContext;
use crate::tracing::prelude::*;
use crate::types::{AlarmStatus, DebouncedAlarm};

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// A device quiet for longer than this is reported.
pub const SILENT_AFTER: Duration = Duration::from_secs(60);

/// All pools down for this long raises the alarm.
const POOLS_DOWN_DEBOUNCE: Duration = Duration::from_secs(60);
const POOLS_DOWN_REMINDER: Duration = Duration::from_secs(600);

pub async fn task(ctx: Arc<MiningContext>) {
    let mut watchdog = Watchdog::new();
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = ctx.shutdown.cancelled() => break,
        }
        watchdog.check(&ctx);
    }
    debug!("Watchdog stopped.");
}

pub(crate) struct Watchdog {
    pools_down: DebouncedAlarm,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            pools_down: DebouncedAlarm::new(POOLS_DOWN_DEBOUNCE).with_repeat(POOLS_DOWN_REMINDER),
        }
    }

    pub(crate) fn check(&mut self, ctx: &MiningContext) {
        let check = ctx.stale_check();
        if ctx.queue.prune_stale(|w| check.is_stale(w, false)) > 0 {
            ctx.queue.request_work();
        }

        let pools = ctx.pools.pools();
        let all_down = !pools.is_empty() && pools.iter().all(|p| !p.is_workable());
        match self.pools_down.check(all_down) {
            AlarmStatus::Triggered | AlarmStatus::Reminder => {
                let listing: Vec<String> = pools
                    .iter()
                    .map(|p| {
                        let state = p.state();
                        format!("{} {} {:?}/{:?}", p.number(), p.url(), state.enabled, state.liveness)
                    })
                    .collect();
                error!(pools = ?listing, "No usable pool.");
            }
            AlarmStatus::Resolved => info!("A pool is usable again."),
            _ => {}
        }

        for device in ctx.devices.all() {
            let silent_for = device.silent_for();
            if silent_for > SILENT_AFTER && device.mark_silent() {
                warn!(
                    device = %device.name(),
                    silent_secs = silent_for.as_secs(),
                    "Device not responding."
                );
            }
        }
    }

    pub(crate) fn pools_down_raised(&self) -> bool {
        self.pools_down.is_raised()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::Algorithm;
    use crate::pool::Liveness;
    use crate::test_support::{test_config, context_with, work_on};
    use crate::work::staging::DeviceCapability;

    #[tokio::test(start_paused = true)]
    async fn test_prunes_expired_work() {
        let mut config = test_config(1);
        config.expiry_secs = 30;
        let ctx = context_with(config);
        let pool = ctx.pools.pool(0).unwrap();
        ctx.stage_work(work_on(&ctx, &pool, [1u8; 32]));
        let mut watchdog = Watchdog::new();

        watchdog.check(&ctx);
        assert_eq!(ctx.queue.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        watchdog.check(&ctx);
        assert!(ctx.queue.is_empty());
        assert_eq!(ctx.stats.shares.snapshot().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_pools_down_alarm() {
        let ctx = context_with(test_config(2));
        for pool in ctx.pools.pools() {
            pool.state().liveness = Liveness::Dead;
        }
        let mut watchdog = Watchdog::new();

        watchdog.check(&ctx);
        assert!(!watchdog.pools_down_raised(), "brief outages stay quiet");
        tokio::time::advance(POOLS_DOWN_DEBOUNCE).await;
        watchdog.check(&ctx);
        assert!(watchdog.pools_down_raised());

        ctx.pools.pool(1).unwrap().state().liveness = Liveness::Alive;
        watchdog.check(&ctx);
        assert!(!watchdog.pools_down_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_reported_once() {
        let ctx = context_with(test_config(1));
        let device = ctx
            .devices
            .register("dev0", DeviceCapability::new(Algorithm::Sha256d), 1);
        let mut watchdog = Watchdog::new();

        tokio::time::advance(Duration::from_secs(61)).await;
        watchdog.check(&ctx);
        assert!(!device.mark_silent(), "already flagged by the watchdog");

        ctx.report_device_alive(device.id());
        assert!(device.silent_for() < SILENT_AFTER);
    }
}
