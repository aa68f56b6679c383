//! Miner daemon.
//!
//! Configuration comes from the environment; see [`hashfeed::config`].

use hashfeed::daemon::Daemon;
use hashfeed::tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();
    Daemon::from_env()?.run().await
}
