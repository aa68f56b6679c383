//! Pool selection policies.
//!
//! Pure functions over the registry's locked interior. The caller holds the
//! registry write lock for the duration, so the pool list cannot change
//! shape mid-selection; individual pool state is locked briefly per pool.

use std::sync::Arc;

use super::registry::RegistryInner;
use super::{Pool, Strategy};
use crate::goal::Algorithm;

fn serves(pool: &Pool, algo: Option<Algorithm>) -> bool {
    algo.is_none_or(|a| pool.algorithm() == a)
}

/// Pools ordered by priority, ties broken by index.
pub(super) fn priority_order(inner: &RegistryInner) -> Vec<Arc<Pool>> {
    let mut ordered: Vec<(usize, usize, Arc<Pool>)> = inner
        .pools
        .iter()
        .enumerate()
        .map(|(i, p)| (p.state().prio, i, p.clone()))
        .collect();
    ordered.sort_by_key(|(prio, i, _)| (*prio, *i));
    ordered.into_iter().map(|(_, _, p)| p).collect()
}

/// Best-priority workable pool.
pub(super) fn select_failover(inner: &RegistryInner, algo: Option<Algorithm>) -> Option<Arc<Pool>> {
    priority_order(inner)
        .into_iter()
        .find(|p| serves(p, algo) && p.state().is_workable())
}

/// Workable pool with the fewest shares handed out so far.
///
/// Failover-only pools are used only when nothing else is workable.
pub(super) fn select_balanced(inner: &RegistryInner, algo: Option<Algorithm>) -> Option<Arc<Pool>> {
    let mut best: Option<(u64, &Arc<Pool>)> = None;
    for pool in &inner.pools {
        if !serves(pool, algo) {
            continue;
        }
        let state = pool.state();
        if !state.is_workable() || state.failover_only {
            continue;
        }
        if best.is_none_or(|(lowest, _)| state.shares < lowest) {
            best = Some((state.shares, pool));
        }
    }

    let chosen = match best {
        Some((_, pool)) => Some(pool.clone()),
        None => priority_order(inner).into_iter().find(|p| {
            let state = p.state();
            serves(p, algo) && state.is_workable() && state.failover_only
        }),
    }?;
    chosen.state().shares += 1;
    Some(chosen)
}

fn has_quota_left(pool: &Pool) -> bool {
    let state = pool.state();
    state.is_workable()
        && !state.failover_only
        && state.quota_gcd > 0
        && state.quota_used < state.quota_gcd
}

/// Quota rotation. The cursor stays on a pool until its normalized quota
/// is used up; when no pool has quota left, every pool's usage is reset.
pub(super) fn select_quota(inner: &mut RegistryInner) -> Option<Arc<Pool>> {
    let n = inner.pools.len();
    if n == 0 {
        return None;
    }

    for pass in 0..2 {
        for _ in 0..n {
            inner.cursor %= n;
            let pool = inner.pools[inner.cursor].clone();
            if has_quota_left(&pool) {
                let mut state = pool.state();
                state.quota_used += 1;
                if state.quota_used >= state.quota_gcd {
                    inner.cursor = (inner.cursor + 1) % n;
                }
                drop(state);
                return Some(pool);
            }
            inner.cursor = (inner.cursor + 1) % n;
        }

        if pass == 0 {
            for pool in &inner.pools {
                pool.state().quota_used = 0;
            }
        }
    }
    None
}

/// Quota selection scoped to one algorithm. Picks the least-used pool by
/// quota ratio and leaves the shared cursor alone.
pub(super) fn select_quota_for(inner: &RegistryInner, algo: Algorithm) -> Option<Arc<Pool>> {
    let candidates: Vec<&Arc<Pool>> = inner
        .pools
        .iter()
        .filter(|p| {
            let state = p.state();
            serves(p, Some(algo)) && state.is_workable() && !state.failover_only && state.quota_gcd > 0
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let least_used = || {
        candidates
            .iter()
            .filter(|p| has_quota_left(p))
            .map(|p| {
                let state = p.state();
                (state.quota_used as f64 / state.quota_gcd as f64, *p)
            })
            .min_by(|(ra, _), (rb, _)| ra.total_cmp(rb))
            .map(|(_, p)| p.clone())
    };

    let chosen = least_used().or_else(|| {
        for pool in &candidates {
            pool.state().quota_used = 0;
        }
        least_used()
    })?;
    chosen.state().quota_used += 1;
    Some(chosen)
}

/// Round robin: stay on the current pool while it is workable and we are
/// keeping up; otherwise move to the next workable pool by index.
pub(super) fn select_rotation(
    inner: &RegistryInner,
    lagging: bool,
    algo: Option<Algorithm>,
) -> Option<Arc<Pool>> {
    let n = inner.pools.len();
    if n == 0 {
        return None;
    }
    let current_index = inner
        .current
        .as_ref()
        .and_then(|cp| inner.pools.iter().position(|p| Arc::ptr_eq(p, cp)));

    if let (Some(i), false) = (current_index, lagging) {
        let cp = &inner.pools[i];
        if serves(cp, algo) && cp.state().is_workable() {
            return Some(cp.clone());
        }
    }

    let start = current_index.unwrap_or(n - 1);
    (1..=n)
        .map(|step| &inner.pools[(start + step) % n])
        .find(|p| serves(p, algo) && p.state().is_workable())
        .cloned()
}

/// Last resort when every policy came up empty: the current pool, or any
/// enabled pool by priority even if it is believed down.
fn select_last_resort(inner: &RegistryInner, algo: Option<Algorithm>) -> Option<Arc<Pool>> {
    let enabled = |p: &Arc<Pool>| {
        let state = p.state();
        !state.removed && state.enabled == super::PoolEnableState::Enabled
    };
    if let Some(cp) = inner.current.as_ref().filter(|cp| serves(cp, algo) && enabled(cp)) {
        return Some(cp.clone());
    }
    priority_order(inner)
        .into_iter()
        .find(|p| serves(p, algo) && enabled(p))
        .or_else(|| inner.current.clone().filter(|cp| serves(cp, algo)))
}

/// Pick a pool to fetch work from.
pub(super) fn select(
    inner: &mut RegistryInner,
    lagging: bool,
    algo: Option<Algorithm>,
    fail_only: bool,
) -> Option<Arc<Pool>> {
    if fail_only && !inner.strategy.is_multi_pool() {
        // Strict failover mines only on the current pool. If it does not
        // serve the requested algorithm there is no answer.
        return match &inner.current {
            Some(cp) if serves(cp, algo) => Some(cp.clone()),
            Some(_) => None,
            None => select_failover(inner, algo).or_else(|| select_last_resort(inner, algo)),
        };
    }

    let chosen = match (inner.strategy, algo) {
        (Strategy::Balance, _) => select_balanced(inner, algo),
        (Strategy::LoadBalance, None) => select_quota(inner),
        (Strategy::LoadBalance, Some(a)) => select_quota_for(inner, a),
        (Strategy::RoundRobin | Strategy::Rotate, _) => select_rotation(inner, lagging, algo),
        (Strategy::Failover, _) => None,
    };

    chosen
        .or_else(|| select_failover(inner, algo))
        .or_else(|| select_last_resort(inner, algo))
}

/// Greatest common divisor of the quotas of all pools with a quota.
fn quota_gcd(inner: &RegistryInner) -> (u32, usize) {
    fn gcd(a: u32, b: u32) -> u32 {
        if b == 0 { a } else { gcd(b, a % b) }
    }
    inner
        .pools
        .iter()
        .map(|p| p.state().quota)
        .filter(|q| *q > 0)
        .fold((0, 0), |(g, count), q| (gcd(g, q), count + 1))
}

/// Recompute each pool's normalized quota.
///
/// Quotas are divided by their common GCD only when two or more pools
/// carry one; a lone pool keeps its raw quota as its allowance. Usage
/// counters are left alone, so repeated calls are a fixed point.
pub(super) fn normalize_quota(inner: &mut RegistryInner) -> u32 {
    let (gcd, count) = quota_gcd(inner);
    let divisor = if count >= 2 { gcd.max(1) } else { 1 };
    for pool in &inner.pools {
        let mut state = pool.state();
        state.quota_gcd = state.quota / divisor;
    }
    inner.quota_gcd = gcd.max(1);
    inner.quota_gcd
}
