//! The pool list and the current pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use super::selector;
use super::{
    INVALID_POOL_NUMBER, Liveness, Pool, PoolEnableState, PoolSpec, Protocol, Strategy,
};
use crate::error::PoolError;
use crate::goal::{Algorithm, MiningGoal};
use crate::stats::CounterSnapshot;

pub(super) struct RegistryInner {
    pub(super) pools: Vec<Arc<Pool>>,
    pub(super) current: Option<Arc<Pool>>,
    pub(super) strategy: Strategy,
    pub(super) rotate_period: Duration,
    pub(super) last_rotate: Instant,
    /// Load-balance rotation position.
    pub(super) cursor: usize,
    pub(super) quota_gcd: u32,
}

/// Outcome of [`PoolRegistry::switch_pools`].
#[derive(Debug, Clone)]
pub struct PoolSwitch {
    pub from: Option<Arc<Pool>>,
    pub to: Option<Arc<Pool>>,
}

impl PoolSwitch {
    pub fn changed(&self) -> bool {
        match (&self.from, &self.to) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        }
    }
}

/// Operator-facing view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub number: usize,
    pub url: String,
    pub user: String,
    pub goal: String,
    pub algorithm: Algorithm,
    pub prio: usize,
    pub quota: u32,
    pub quota_gcd: u32,
    pub quota_used: u32,
    pub enabled: PoolEnableState,
    pub liveness: Liveness,
    pub protocol: Protocol,
    pub current: bool,
    pub longpoll: bool,
    pub stats: CounterSnapshot,
}

pub struct PoolRegistry {
    inner: RwLock<RegistryInner>,
}

impl PoolRegistry {
    pub fn new(strategy: Strategy, rotate_period: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                pools: Vec::new(),
                current: None,
                strategy,
                rotate_period,
                last_rotate: Instant::now(),
                cursor: 0,
                quota_gcd: 1,
            }),
        }
    }

    /// Append a pool at the lowest priority. The first pool added becomes
    /// the current pool.
    pub fn add_pool(&self, spec: PoolSpec, goal: Arc<MiningGoal>) -> Arc<Pool> {
        let mut inner = self.inner.write();
        let number = inner.pools.len();
        let pool = Arc::new(Pool::new(number, spec, goal));
        inner.pools.push(pool.clone());
        if inner.current.is_none() {
            inner.current = Some(pool.clone());
        }
        selector::normalize_quota(&mut inner);
        pool
    }

    /// Remove a pool from the list.
    ///
    /// The last slot moves into the removed pool's index and the removed
    /// pool gets [`INVALID_POOL_NUMBER`]. Does nothing and returns false if
    /// this is the only pool or the current pool.
    pub fn remove_pool(&self, number: usize) -> bool {
        let mut inner = self.inner.write();
        if inner.pools.len() <= 1 {
            return false;
        }
        let Some(index) = inner.pools.iter().position(|p| p.number() == number) else {
            return false;
        };
        let pool = inner.pools[index].clone();
        if inner.current.as_ref().is_some_and(|cp| Arc::ptr_eq(cp, &pool)) {
            return false;
        }

        let removed_prio = {
            let mut state = pool.state();
            state.enabled = PoolEnableState::Disabled;
            state.removed = true;
            state.prio
        };
        for other in inner.pools.iter().filter(|p| !Arc::ptr_eq(p, &pool)) {
            let mut state = other.state();
            if state.prio > removed_prio {
                state.prio -= 1;
            }
        }

        inner.pools.swap_remove(index);
        if let Some(moved) = inner.pools.get(index) {
            moved.set_number(index);
        }
        pool.set_number(INVALID_POOL_NUMBER);
        if inner.cursor >= inner.pools.len() {
            inner.cursor = 0;
        }
        selector::normalize_quota(&mut inner);
        true
    }

    pub fn pool(&self, number: usize) -> Result<Arc<Pool>, PoolError> {
        self.inner
            .read()
            .pools
            .get(number)
            .cloned()
            .ok_or(PoolError::UnknownPool(number))
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.inner.read().pools.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().pools.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.inner
            .read()
            .pools
            .iter()
            .filter(|p| p.state().enabled == PoolEnableState::Enabled)
            .count()
    }

    pub fn current(&self) -> Option<Arc<Pool>> {
        self.inner.read().current.clone()
    }

    pub fn is_current(&self, pool: &Arc<Pool>) -> bool {
        self.inner
            .read()
            .current
            .as_ref()
            .is_some_and(|cp| Arc::ptr_eq(cp, pool))
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.read().strategy
    }

    pub fn rotate_period(&self) -> Duration {
        self.inner.read().rotate_period
    }

    /// Change strategy. `rotate_period` applies to [`Strategy::Rotate`].
    pub fn switch_strategy(&self, strategy: Strategy, rotate_period: Option<Duration>) {
        let mut inner = self.inner.write();
        inner.strategy = strategy;
        if let Some(period) = rotate_period {
            inner.rotate_period = period;
        }
        inner.last_rotate = Instant::now();
    }

    /// Whether a rotate-strategy switch is due, restarting the period if so.
    pub fn take_rotate_due(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.strategy != Strategy::Rotate || inner.rotate_period.is_zero() {
            return false;
        }
        if inner.last_rotate.elapsed() < inner.rotate_period {
            return false;
        }
        inner.last_rotate = Instant::now();
        true
    }

    /// The pool after the current one in index order.
    pub fn next_after_current(&self) -> Option<Arc<Pool>> {
        let inner = self.inner.read();
        let n = inner.pools.len();
        let cp = inner.current.as_ref()?;
        let i = inner.pools.iter().position(|p| Arc::ptr_eq(p, cp))?;
        Some(inner.pools[(i + 1) % n].clone())
    }

    /// Pools in priority order.
    pub fn priority_order(&self) -> Vec<Arc<Pool>> {
        selector::priority_order(&self.inner.read())
    }

    /// Move a pool to position `prio` in priority order and renumber the
    /// rest densely.
    pub fn set_priority(&self, number: usize, prio: usize) -> Result<(), PoolError> {
        let inner = self.inner.write();
        let pool = inner
            .pools
            .get(number)
            .cloned()
            .ok_or(PoolError::UnknownPool(number))?;
        let mut order: Vec<Arc<Pool>> = selector::priority_order(&inner)
            .into_iter()
            .filter(|p| !Arc::ptr_eq(p, &pool))
            .collect();
        order.insert(prio.min(order.len()), pool);
        for (i, p) in order.iter().enumerate() {
            p.state().prio = i;
        }
        Ok(())
    }

    pub fn set_quota(&self, number: usize, quota: u32) -> Result<u32, PoolError> {
        let mut inner = self.inner.write();
        let pool = inner
            .pools
            .get(number)
            .cloned()
            .ok_or(PoolError::UnknownPool(number))?;
        pool.state().quota = quota;
        Ok(selector::normalize_quota(&mut inner))
    }

    /// Recompute normalized quotas; returns the registry-wide GCD.
    pub fn normalize_quota(&self) -> u32 {
        selector::normalize_quota(&mut self.inner.write())
    }

    pub fn quota_gcd(&self) -> u32 {
        self.inner.read().quota_gcd
    }

    pub fn set_enable_state(
        &self,
        number: usize,
        enabled: PoolEnableState,
    ) -> Result<Arc<Pool>, PoolError> {
        let pool = self.pool(number)?;
        self.set_pool_enable_state(&pool, enabled)?;
        Ok(pool)
    }

    /// Like [`Self::set_enable_state`] for a pool already in hand. Pool
    /// numbers shift on removal, the `Arc` does not.
    pub fn set_pool_enable_state(
        &self,
        pool: &Arc<Pool>,
        enabled: PoolEnableState,
    ) -> Result<(), PoolError> {
        let inner = self.inner.read();
        if !inner.pools.iter().any(|p| Arc::ptr_eq(p, pool)) {
            return Err(PoolError::Removed);
        }
        pool.state().enabled = enabled;
        Ok(())
    }

    /// Choose a pool to fetch from. See [`selector`] for the policies.
    pub fn select_pool(
        &self,
        lagging: bool,
        algo: Option<Algorithm>,
        fail_only: bool,
    ) -> Option<Arc<Pool>> {
        selector::select(&mut self.inner.write(), lagging, algo, fail_only)
    }

    /// Recompute the current pool, first moving `selected` to priority 0
    /// if given.
    pub fn switch_pools(&self, selected: Option<&Arc<Pool>>) -> PoolSwitch {
        let mut inner = self.inner.write();
        let from = inner.current.clone();

        if let Some(selected) = selected {
            let selected_prio = selected.state().prio;
            if selected_prio != 0 {
                for pool in inner.pools.iter().filter(|p| !Arc::ptr_eq(p, selected)) {
                    let mut state = pool.state();
                    if state.prio < selected_prio {
                        state.prio += 1;
                    }
                }
            }
            selected.state().prio = 0;
        }

        let to = match inner.strategy {
            Strategy::Failover | Strategy::LoadBalance | Strategy::Balance => {
                selector::priority_order(&inner)
                    .into_iter()
                    .find(|p| p.state().is_workable())
            }
            Strategy::RoundRobin | Strategy::Rotate => {
                match selected.filter(|p| p.state().is_workable()) {
                    Some(p) => Some(p.clone()),
                    None => {
                        let n = inner.pools.len();
                        let start = from
                            .as_ref()
                            .and_then(|cp| inner.pools.iter().position(|p| Arc::ptr_eq(p, cp)))
                            .unwrap_or(n.saturating_sub(1));
                        (1..=n)
                            .map(|step| &inner.pools[(start + step) % n])
                            .find(|p| p.state().is_workable())
                            .cloned()
                    }
                }
            }
        };

        let to = to.or_else(|| from.clone());
        inner.current = to.clone();
        PoolSwitch { from, to }
    }

    pub fn list_pools(&self) -> Vec<PoolInfo> {
        let inner = self.inner.read();
        inner
            .pools
            .iter()
            .map(|pool| {
                let current = inner
                    .current
                    .as_ref()
                    .is_some_and(|cp| Arc::ptr_eq(cp, pool));
                let state = pool.state();
                PoolInfo {
                    number: pool.number(),
                    url: pool.url().to_string(),
                    user: pool.user().to_string(),
                    goal: pool.goal().name().to_string(),
                    algorithm: pool.algorithm(),
                    prio: state.prio,
                    quota: state.quota,
                    quota_gcd: state.quota_gcd,
                    quota_used: state.quota_used,
                    enabled: state.enabled,
                    liveness: state.liveness,
                    protocol: state.protocol,
                    current,
                    longpoll: state.longpoll_url.is_some(),
                    stats: pool.stats.snapshot(),
                }
            })
            .collect()
    }
}
