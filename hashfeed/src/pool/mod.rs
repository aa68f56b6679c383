//! Upstream pools.
//!
//! A [`Pool`] is shared as `Arc<Pool>`: the registry holds one reference and
//! every work item fetched from the pool holds another, so a removed pool
//! stays alive for as long as any work still points at it. Identity is
//! pointer identity; the pool number is only a display/operator index and
//! changes when other pools are removed.
//!
//! Frequently mutated fields live in one [`PoolState`] behind a per-pool
//! mutex. Structural changes to the pool list go through the registry's
//! lock instead. Never take the registry lock while holding a pool lock.

mod connection;
pub mod liveness;
mod registry;
mod selector;

pub use connection::{Connection, ConnectionPool, connection_cap};
pub use registry::{PoolInfo, PoolRegistry, PoolSwitch};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::time::Instant;

use crate::goal::{Algorithm, MiningGoal};
use crate::stats::ShareCounters;
use crate::work::stratum::StratumSession;
use crate::work::template::BlockTemplate;

/// Number given to pools that have been removed.
pub const INVALID_POOL_NUMBER: usize = usize::MAX;

/// How work is spread across pools.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Strategy {
    /// Mine on the best-priority pool that is up.
    #[default]
    Failover,
    /// Stay on one pool until it fails, then move to the next.
    RoundRobin,
    /// Like round robin, plus a forced move every rotate period.
    Rotate,
    /// Spread work by configured quota.
    LoadBalance,
    /// Spread work so each pool sees roughly equal shares.
    Balance,
}

impl Strategy {
    /// Strategies that keep several pools active at once.
    pub fn is_multi_pool(self) -> bool {
        matches!(self, Strategy::LoadBalance | Strategy::Balance)
    }
}

/// Operator or automatic enablement. Independent of reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum PoolEnableState {
    Enabled,
    Disabled,
    /// Disabled automatically after a run of rejected shares; comes back on
    /// its own when a share is accepted.
    Rejecting,
    /// Disabled automatically for protocol violations.
    Misbehaving,
}

/// Work protocol in use for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum Protocol {
    GetWork,
    GetBlockTemplate,
    Stratum,
}

impl Protocol {
    /// Guess the protocol from a pool URL scheme.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("stratum") {
            Protocol::Stratum
        } else {
            Protocol::GetBlockTemplate
        }
    }
}

/// Reachability, driven by fetch results and background probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum Liveness {
    Untested,
    Testing,
    Alive,
    /// A probe failed.
    Dead,
    /// Was alive, then fetches started failing.
    Idle,
}

impl Liveness {
    pub fn is_down(self) -> bool {
        matches!(self, Liveness::Dead | Liveness::Idle)
    }
}

#[derive(Debug, Clone)]
pub struct PoolState {
    pub enabled: PoolEnableState,
    /// Lower is preferred.
    pub prio: usize,
    pub quota: u32,
    pub quota_used: u32,
    /// Quota normalized by the registry-wide GCD.
    pub quota_gcd: u32,
    pub protocol: Protocol,
    pub liveness: Liveness,
    pub idle_since: Option<Instant>,
    pub alive_since: Option<Instant>,
    pub lagging: bool,
    /// Block id of the last work this pool gave us, 0 if none yet.
    pub block_id: u32,
    pub work_restart_id: u32,
    pub work_restart_time: Option<Instant>,
    pub submit_old: bool,
    pub longpoll_url: Option<String>,
    /// A longpoll listener task exists for this pool.
    pub longpoll_running: bool,
    /// Last block template fetched, kept to generate more work locally.
    pub template: Option<Arc<BlockTemplate>>,
    pub removed: bool,
    pub failover_only: bool,
    pub direct_block_submit: bool,
    /// Share counter for the balance strategy.
    pub shares: u64,
    pub seq_rejects: u32,
    pub seq_getfails: u32,
    pub submit_fail: bool,
    /// Rolling average getwork round trip, in seconds.
    pub getwork_rtt: f64,
    pub last_work: Option<Instant>,
}

impl PoolState {
    fn new(quota: u32, protocol: Protocol) -> Self {
        Self {
            enabled: PoolEnableState::Enabled,
            prio: 0,
            quota,
            quota_used: 0,
            quota_gcd: quota,
            protocol,
            liveness: Liveness::Untested,
            idle_since: None,
            alive_since: None,
            lagging: false,
            block_id: 0,
            work_restart_id: 0,
            work_restart_time: None,
            submit_old: false,
            longpoll_url: None,
            longpoll_running: false,
            template: None,
            removed: false,
            failover_only: false,
            direct_block_submit: false,
            shares: 0,
            seq_rejects: 0,
            seq_getfails: 0,
            submit_fail: false,
            getwork_rtt: 0.0,
            last_work: None,
        }
    }

    /// Enabled and not known to be down.
    pub fn is_workable(&self) -> bool {
        !self.removed && self.enabled == PoolEnableState::Enabled && !self.liveness.is_down()
    }

    /// Extra seconds to knock off a work expiry window for slow pools.
    pub fn work_delay(&self) -> Duration {
        Duration::from_secs_f64(self.getwork_rtt * 5.0 + 1.0)
    }

    pub fn record_getwork_rtt(&mut self, rtt: Duration) {
        self.getwork_rtt = if self.getwork_rtt == 0.0 {
            rtt.as_secs_f64()
        } else {
            (self.getwork_rtt * 63.0 + rtt.as_secs_f64()) / 64.0
        };
    }
}

#[derive(Debug)]
pub struct Pool {
    number: AtomicUsize,
    url: String,
    user: String,
    pass: String,
    proxy: Option<String>,
    goal: Arc<MiningGoal>,
    state: Mutex<PoolState>,
    pub stats: ShareCounters,
    pub connections: ConnectionPool,
    pub stratum: RwLock<StratumSession>,
}

/// Credentials and placement for a new pool.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub proxy: Option<String>,
    pub quota: u32,
    pub failover_only: bool,
    pub direct_block_submit: bool,
}

impl PoolSpec {
    pub fn new(url: &str, user: &str, pass: &str) -> Self {
        Self {
            url: url.to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
            proxy: None,
            quota: 1,
            failover_only: false,
            direct_block_submit: false,
        }
    }
}

impl Pool {
    pub(crate) fn new(number: usize, spec: PoolSpec, goal: Arc<MiningGoal>) -> Self {
        let mut state = PoolState::new(spec.quota, Protocol::from_url(&spec.url));
        state.prio = number;
        state.failover_only = spec.failover_only;
        state.direct_block_submit = spec.direct_block_submit;
        Self {
            number: AtomicUsize::new(number),
            url: spec.url,
            user: spec.user,
            pass: spec.pass,
            proxy: spec.proxy,
            goal,
            state: Mutex::new(state),
            stats: ShareCounters::default(),
            connections: ConnectionPool::new(),
            stratum: RwLock::new(StratumSession::default()),
        }
    }

    pub fn number(&self) -> usize {
        self.number.load(Ordering::Relaxed)
    }

    pub(crate) fn set_number(&self, number: usize) {
        self.number.store(number, Ordering::Relaxed);
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn pass(&self) -> &str {
        &self.pass
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn goal(&self) -> &Arc<MiningGoal> {
        &self.goal
    }

    pub fn algorithm(&self) -> Algorithm {
        self.goal.algorithm()
    }

    pub fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock()
    }

    pub fn protocol(&self) -> Protocol {
        self.state.lock().protocol
    }

    pub fn liveness(&self) -> Liveness {
        self.state.lock().liveness
    }

    pub fn is_workable(&self) -> bool {
        self.state.lock().is_workable()
    }

    pub fn longpoll_url(&self) -> Option<String> {
        self.state.lock().longpoll_url.clone()
    }

    /// Has a way to hear about new blocks without polling.
    pub fn has_push_notify(&self) -> bool {
        let has_longpoll = self.state.lock().longpoll_url.is_some();
        has_longpoll || self.stratum.read().active
    }
}

/// Pointer identity for pools.
pub fn same_pool(a: &Arc<Pool>, b: &Arc<Pool>) -> bool {
    Arc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use test_case::test_case;

    #[test_case("failover", Strategy::Failover)]
    #[test_case("Round-Robin", Strategy::RoundRobin)]
    #[test_case("rotate", Strategy::Rotate)]
    #[test_case("load-balance", Strategy::LoadBalance)]
    #[test_case("BALANCE", Strategy::Balance)]
    fn test_strategy_names(name: &str, expected: Strategy) {
        assert_eq!(Strategy::from_str(name).unwrap(), expected);
    }

    #[test]
    fn test_protocol_from_url() {
        assert_eq!(
            Protocol::from_url("stratum+tcp://pool:3333"),
            Protocol::Stratum
        );
        assert_eq!(
            Protocol::from_url("http://node:8332"),
            Protocol::GetBlockTemplate
        );
    }

    #[test]
    fn test_getwork_rtt_rolling_average() {
        let mut state = PoolState::new(1, Protocol::GetWork);
        state.record_getwork_rtt(Duration::from_secs(2));
        assert_eq!(state.getwork_rtt, 2.0);
        state.record_getwork_rtt(Duration::from_secs(66));
        assert_eq!(state.getwork_rtt, 3.0);
        assert_eq!(state.work_delay(), Duration::from_secs(16));
    }

    #[test]
    fn test_workable() {
        let mut state = PoolState::new(1, Protocol::GetWork);
        assert!(state.is_workable(), "untested pools are workable");
        state.liveness = Liveness::Idle;
        assert!(!state.is_workable());
        state.liveness = Liveness::Alive;
        state.enabled = PoolEnableState::Rejecting;
        assert!(!state.is_workable());
    }
}
