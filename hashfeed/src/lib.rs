//! Work distribution and pool failover for multi-device miners.
//!
//! The crate sits between mining devices and upstream pools. A scheduler
//! task keeps a staging queue topped up with work fetched from pools chosen
//! by the configured strategy, devices pop work from that queue, and found
//! nonces flow back upstream through the submission pipeline. Block changes
//! seen on any pool invalidate outdated work and signal devices to restart.
//!
//! Everything hangs off one [`context::MiningContext`], passed around as an
//! `Arc`, so independent contexts can coexist in tests.

pub mod config;
pub mod context;
pub mod daemon;
pub mod device;
pub mod error;
pub mod goal;
pub mod longpoll;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod scheduler;
pub mod stats;
pub mod submit;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod watchdog;
pub mod work;

#[cfg(test)]
pub(crate) mod test_support;
