//! Mining goals.
//!
//! A goal groups pools that mine the same chain with the same algorithm.
//! Each goal owns a [`BlockchainTracker`] so block changes reported by any
//! of its pools are seen by all of them. Goals are created on first
//! reference and live for the rest of the process.

mod blockchain;

pub use blockchain::{BLOCK_HISTORY, BlockChange, BlockRecord, BlockchainTracker, block_id_of};

use std::sync::Arc;

use bitcoin::pow::{CompactTarget, Target};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::stats::ShareCounters;
use crate::tracing::prelude::*;
use crate::types::{Difficulty, HashRate};

/// Proof-of-work algorithm a goal mines.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Algorithm {
    #[default]
    Sha256d,
    Scrypt,
    Keccak,
}

impl Algorithm {
    /// Target seconds between blocks, for hashrate estimates.
    fn block_interval_secs(self) -> f64 {
        match self {
            Algorithm::Sha256d => 600.0,
            Algorithm::Scrypt => 150.0,
            Algorithm::Keccak => 60.0,
        }
    }
}

/// Human-readable state for operator displays.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GoalDisplay {
    pub block_hash: String,
    pub block_time: String,
    pub difficulty: String,
    pub hashrate: String,
    pub height: u64,
}

#[derive(Debug)]
pub struct MiningGoal {
    name: String,
    id: usize,
    algorithm: Algorithm,
    pub blockchain: BlockchainTracker,
    network_target: RwLock<Option<Target>>,
    // Kept apart from the tracker so display refreshes never wait on block
    // history writers.
    display: RwLock<GoalDisplay>,
    pub stats: ShareCounters,
}

impl MiningGoal {
    fn new(name: &str, id: usize, algorithm: Algorithm) -> Self {
        Self {
            name: name.to_string(),
            id,
            algorithm,
            blockchain: BlockchainTracker::default(),
            network_target: RwLock::new(None),
            display: RwLock::new(GoalDisplay::default()),
            stats: ShareCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn is_default(&self) -> bool {
        self.name == "default"
    }

    /// Network target, if any work has told us the current bits.
    pub fn network_target(&self) -> Option<Target> {
        *self.network_target.read()
    }

    pub fn network_difficulty(&self) -> Option<f64> {
        self.network_target()
            .map(|t| Difficulty::from_target(t).as_f64())
    }

    /// Update the network difficulty from a header's compact bits.
    pub fn set_network_bits(&self, bits: u32) {
        let target = Target::from_compact(CompactTarget::from_consensus(bits));
        let changed = self.network_target.read().as_ref() != Some(&target);
        if changed {
            *self.network_target.write() = Some(target);
            let difficulty = Difficulty::from_target(target);
            let hashrate = HashRate::from_network_difficulty(
                difficulty.as_f64(),
                self.algorithm.block_interval_secs(),
            );
            let mut display = self.display.write();
            display.difficulty = difficulty.to_string();
            display.hashrate = hashrate.to_human_readable();
            debug!(goal = %self.name, difficulty = %difficulty, "Network difficulty updated.");
        }
    }

    /// Refresh display strings for a new tip.
    pub(crate) fn note_new_block(&self, record: &BlockRecord) {
        let mut shown = record.prev_hash;
        shown.reverse();
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let block_time = now
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default();

        let mut shown_display = self.display.write();
        shown_display.block_hash = format!("...{}", hex::encode(&shown[24..]));
        shown_display.block_time = block_time;
        shown_display.height = record.height;
        info!(goal = %self.name, block = %shown_display.block_hash, height = record.height, "New block.");
    }

    pub fn display(&self) -> GoalDisplay {
        self.display.read().clone()
    }
}

/// All goals known to a context.
#[derive(Debug, Default)]
pub struct GoalTable {
    goals: Mutex<Vec<Arc<MiningGoal>>>,
}

impl GoalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a goal by name, creating it on first use.
    ///
    /// A goal's algorithm is fixed by whoever creates it; a later request
    /// naming a different algorithm gets the existing goal and a warning.
    pub fn get_or_create(&self, name: &str, algorithm: Algorithm) -> Arc<MiningGoal> {
        let mut goals = self.goals.lock();
        if let Some(goal) = goals.iter().find(|g| g.name == name) {
            if goal.algorithm != algorithm {
                warn!(
                    goal = name,
                    existing = %goal.algorithm,
                    requested = %algorithm,
                    "Goal already exists with a different algorithm."
                );
            }
            return goal.clone();
        }

        let goal = Arc::new(MiningGoal::new(name, goals.len(), algorithm));
        goals.push(goal.clone());
        goal
    }

    pub fn get(&self, name: &str) -> Option<Arc<MiningGoal>> {
        self.goals.lock().iter().find(|g| g.name == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<MiningGoal>> {
        self.goals.lock().clone()
    }
}
