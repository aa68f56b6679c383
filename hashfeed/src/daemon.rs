//! Daemon lifecycle: build the context, start the long-running tasks, wait
//! for a signal, shut down in order.

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};

use crate::config::MinerConfig;
use crate::context::MiningContext;
use crate::device::{self, WorkHandle};
use crate::pool::liveness;
use crate::protocol::NoStratumTransport;
use crate::rpc::HttpClient;
use crate::tracing::prelude::*;
use crate::{scheduler, submit, watchdog};

/// The main daemon.
pub struct Daemon {
    config: MinerConfig,
}

impl Daemon {
    pub fn new(config: MinerConfig) -> Self {
        Self { config }
    }

    /// Daemon configured from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(MinerConfig::from_env()?))
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let ctx = MiningContext::new(
            self.config,
            Arc::new(HttpClient::new()),
            Arc::new(NoStratumTransport),
        )?;
        let _work = start(&ctx);

        info!(
            pools = ctx.pools.len(),
            strategy = %ctx.pools.strategy(),
            "Started."
        );
        info!("For debugging, set RUST_LOG=hashfeed=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT."),
            _ = sigterm.recv() => info!("Received SIGTERM."),
            _ = ctx.shutdown.cancelled() => {}
        }

        shutdown(&ctx).await;
        let totals = ctx.stats.shares.snapshot();
        info!(
            accepted = totals.accepted,
            rejected = totals.rejected,
            stale = totals.stale,
            hw_errors = totals.hw_errors,
            found_blocks = ctx.stats.found_blocks.load(std::sync::atomic::Ordering::Relaxed),
            "Exiting."
        );
        Ok(())
    }
}

/// Spawn the scheduler, submission worker, pool watcher, watchdog and
/// work service. Devices get work through the returned handle.
pub fn start(ctx: &Arc<MiningContext>) -> WorkHandle {
    let (handle, requests) = device::work_channel();
    ctx.tasks.spawn(submit::worker(ctx.clone()));
    ctx.tasks.spawn(scheduler::task(ctx.clone()));
    ctx.tasks.spawn(liveness::watcher(ctx.clone()));
    ctx.tasks.spawn(watchdog::task(ctx.clone()));
    ctx.tasks.spawn(device::work_service(ctx.clone(), requests));
    handle
}

/// Stop handing out work, cancel every task and wait for them. The
/// submission worker drains outstanding shares before it exits.
pub async fn shutdown(ctx: &MiningContext) {
    info!("Shutting down.");
    ctx.queue.freeze();
    ctx.shutdown.cancel();
    ctx.tasks.close();
    ctx.tasks.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::Algorithm;
    use crate::pool::Liveness;
    use crate::protocol::RawWork;
    use crate::test_support::{header_with_prev, mock_context, test_config};
    use crate::work::staging::DeviceCapability;
    use bitcoin::pow::Target;

    #[tokio::test]
    async fn test_work_flows_to_device_and_shares_back() {
        let (ctx, client, _) = mock_context(test_config(1));
        ctx.pools.pool(0).unwrap().state().liveness = Liveness::Alive;
        for _ in 0..4 {
            client.push_fetch(Ok(RawWork::header(header_with_prev([1u8; 32]), Target::MAX)));
        }
        let device = ctx
            .devices
            .register("dev0", DeviceCapability::new(Algorithm::Sha256d), 1);

        let handle = start(&ctx);
        let work = handle.get_work(device.id()).await.unwrap();
        assert_eq!(work.device, Some(device.id()));

        let share = work.for_share(&ctx.ids, 1, work.device);
        ctx.submit_async(share);
        shutdown(&ctx).await;

        assert_eq!(ctx.stats.in_flight(), 0);
        assert_eq!(device.stats.snapshot().accepted, 1);
        assert!(handle.get_work(device.id()).await.is_none());
    }
}
