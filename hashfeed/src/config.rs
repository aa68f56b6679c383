//! Miner configuration.
//!
//! Loaded from a JSON file named by `HASHFEED_CONFIG`, or from a handful of
//! environment variables for the single-pool case:
//!
//! - `HASHFEED_POOL_URL`: pool address (required without a config file)
//! - `HASHFEED_POOL_USER`: worker name (defaults to "hashfeed")
//! - `HASHFEED_POOL_PASS`: worker password (defaults to "x")
//! - `HASHFEED_STRATEGY`: pool strategy name
//! - `HASHFEED_QUEUE`: extra staged work beyond device demand

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::goal::Algorithm;
use crate::pool::Strategy;
use crate::work::staging::PopPreference;

/// One upstream pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub proxy: Option<String>,
    /// Mining goal name; pools sharing a goal share block tracking.
    pub goal: String,
    pub algorithm: Algorithm,
    /// Load-balance weight. Zero takes the pool out of quota rotation.
    pub quota: u32,
    /// Only used when no other pool is workable.
    pub failover_only: bool,
    /// Receive found blocks directly, in addition to normal submission.
    pub direct_block_submit: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: "hashfeed".into(),
            pass: "x".into(),
            proxy: None,
            goal: "default".into(),
            algorithm: Algorithm::Sha256d,
            quota: 1,
            failover_only: false,
            direct_block_submit: false,
        }
    }
}

/// Tunables for the work and pool subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub strategy: Strategy,
    /// Minutes between forced switches under the rotate strategy.
    pub rotate_period_mins: u64,
    /// Staged work kept beyond what devices are waiting for.
    pub queue: usize,
    pub scantime_secs: u64,
    /// Work lifetime for pools without push notification.
    pub expiry_secs: u64,
    /// Work lifetime for pools with longpoll or stratum.
    pub expiry_lp_secs: u64,
    /// Submission retries; negative retries forever.
    pub retries: i32,
    pub fail_pause_secs: u64,
    /// Strict failover: never mine on anything but the current pool.
    pub fail_only: bool,
    pub submit_stale: bool,
    pub disable_rejecting_pools: bool,
    /// Sequential rejects before a pool is marked rejecting.
    pub reject_threshold: u32,
    /// Stability required before failing back to a better pool.
    pub fail_switch_delay_secs: u64,
    pub delaynet: bool,
    pub benchmark: bool,
    pub pop_preference: PopPreference,
    /// Staged items kept per algorithm with waiting devices.
    pub algo_floor: usize,
    pub drain_timeout_secs: u64,
    pub pools: Vec<PoolConfig>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Failover,
            rotate_period_mins: 0,
            queue: 1,
            scantime_secs: 60,
            expiry_secs: 120,
            expiry_lp_secs: 3600,
            retries: -1,
            fail_pause_secs: 5,
            fail_only: false,
            submit_stale: true,
            disable_rejecting_pools: false,
            reject_threshold: 10,
            fail_switch_delay_secs: 300,
            delaynet: false,
            benchmark: false,
            pop_preference: PopPreference::default(),
            algo_floor: 1,
            drain_timeout_secs: 30,
            pools: Vec::new(),
        }
    }
}

impl MinerConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = env::var("HASHFEED_CONFIG") {
            return Self::from_json_file(&path);
        }

        let mut config = Self::default();

        if let Ok(url) = env::var("HASHFEED_POOL_URL") {
            config.pools.push(PoolConfig {
                url,
                user: env::var("HASHFEED_POOL_USER").unwrap_or_else(|_| "hashfeed".into()),
                pass: env::var("HASHFEED_POOL_PASS").unwrap_or_else(|_| "x".into()),
                ..Default::default()
            });
        }

        if let Ok(name) = env::var("HASHFEED_STRATEGY") {
            config.strategy =
                Strategy::from_str(&name).map_err(|_| ConfigError::InvalidValue {
                    name: "HASHFEED_STRATEGY",
                    value: name.clone(),
                })?;
        }

        if let Ok(queue) = env::var("HASHFEED_QUEUE") {
            config.queue = queue.parse().map_err(|_| ConfigError::InvalidValue {
                name: "HASHFEED_QUEUE",
                value: queue.clone(),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        if let Some(i) = self.pools.iter().position(|p| p.url.is_empty()) {
            return Err(ConfigError::EmptyUrl(i));
        }
        Ok(())
    }

    pub fn rotate_period(&self) -> Duration {
        Duration::from_secs(self.rotate_period_mins * 60)
    }

    pub fn scantime(&self) -> Duration {
        Duration::from_secs(self.scantime_secs)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn expiry_lp(&self) -> Duration {
        Duration::from_secs(self.expiry_lp_secs)
    }

    pub fn fail_pause(&self) -> Duration {
        Duration::from_secs(self.fail_pause_secs)
    }

    pub fn fail_switch_delay(&self) -> Duration {
        Duration::from_secs(self.fail_switch_delay_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
