//! Units of work and everything that creates, stores and retires them.

pub mod extranonce2;
pub mod freshness;
pub mod header;
pub mod staging;
pub mod stratum;
pub mod template;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitcoin::pow::Target;
use thiserror::Error;
use tokio::time::Instant;

use crate::goal::{Algorithm, block_id_of};
use crate::pool::{Pool, Protocol};
use crate::stats::ShareCounters;
use crate::types::Difficulty;

pub use extranonce2::Extranonce2Error;
use header::Header;
use stratum::StratumBinding;
use template::BlockTemplate;

/// Rolls allowed per work item. Each roll moves the time field one second
/// ahead; nodes reject blocks timed more than two hours in the future.
pub const MAX_ROLLS: u32 = 7000;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Header must be at least 80 bytes, got {0}")]
    BadHeader(usize),

    #[error("Target must be 32 bytes, got {0}")]
    BadTarget(usize),

    #[error("Extranonce2 space exhausted")]
    Nonce2Exhausted,

    #[error(transparent)]
    Extranonce2(#[from] Extranonce2Error),

    #[error("No stratum job to build work from")]
    NoStratumJob,

    #[error("Block template exhausted")]
    TemplateExhausted,
}

/// Allocator for work ids. Ids are unique across clones and rolls.
#[derive(Debug, Default)]
pub struct WorkIds {
    next: AtomicU64,
}

impl WorkIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Protocol-specific data shared across clones.
#[derive(Debug, Clone)]
pub enum WorkExtension {
    Template(Arc<BlockTemplate>),
    Stratum(StratumBinding),
}

#[derive(Debug)]
pub struct Work {
    id: u64,
    pub header: Header,
    pub midstate: [u8; 32],
    /// Share target.
    pub target: Target,
    pub difficulty: Difficulty,
    pub pool: Arc<Pool>,
    pub protocol: Protocol,
    /// Must not be discarded as stale.
    pub mandatory: bool,
    pub stale: bool,
    pub clone: bool,
    /// Generated ahead of demand for a specific algorithm.
    pub spare: bool,
    /// Came from a longpoll reply or a clean stratum job.
    pub longpoll: bool,
    pub rolls: u32,
    /// How long the pool lets us roll the time field.
    pub rolltime: Option<Duration>,
    pub created: Instant,
    pub staged: Instant,
    pub cloned_at: Option<Instant>,
    /// Pool restart generation at creation.
    pub work_restart_id: u32,
    /// Block height, 0 if unknown.
    pub height: u64,
    /// Device that found the nonce, for shares.
    pub device: Option<usize>,
    /// Difficulty the nonce achieved, for shares.
    pub share_difficulty: f64,
    pub extension: Option<WorkExtension>,
}

impl Work {
    pub fn new(
        ids: &WorkIds,
        pool: Arc<Pool>,
        header: Header,
        target: Target,
        protocol: Protocol,
    ) -> Self {
        let now = Instant::now();
        let work_restart_id = pool.state().work_restart_id;
        Self {
            id: ids.next(),
            midstate: header::midstate(&header),
            header,
            target,
            difficulty: Difficulty::from_target(target),
            pool,
            protocol,
            mandatory: false,
            stale: false,
            clone: false,
            spare: false,
            longpoll: false,
            rolls: 0,
            rolltime: None,
            created: now,
            staged: now,
            cloned_at: None,
            work_restart_id,
            height: 0,
            device: None,
            share_difficulty: 0.0,
            extension: None,
        }
    }

    /// Work from the next header of a block template.
    pub fn from_template(
        ids: &WorkIds,
        pool: Arc<Pool>,
        template: &Arc<BlockTemplate>,
    ) -> Result<Self, WorkError> {
        let header = template.next_header().ok_or(WorkError::TemplateExhausted)?;
        let mut work = Self::new(
            ids,
            pool,
            header,
            template.target,
            Protocol::GetBlockTemplate,
        );
        work.height = template.height;
        work.rolltime = Some(template.expires());
        work.extension = Some(WorkExtension::Template(template.clone()));
        Ok(work)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prev_hash(&self) -> [u8; 32] {
        header::prev_hash(&self.header)
    }

    pub fn block_id(&self) -> u32 {
        block_id_of(&self.prev_hash())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.pool.algorithm()
    }

    pub fn template(&self) -> Option<&Arc<BlockTemplate>> {
        match &self.extension {
            Some(WorkExtension::Template(t)) => Some(t),
            _ => None,
        }
    }

    pub fn stratum_binding(&self) -> Option<&StratumBinding> {
        match &self.extension {
            Some(WorkExtension::Stratum(b)) => Some(b),
            _ => None,
        }
    }

    /// Eligible for time rolling and counted as such in the staging queue.
    /// Template work never is: its template hands out the time offsets.
    pub fn is_rollable(&self) -> bool {
        !self.clone && self.rolltime.is_some() && self.template().is_none()
    }

    /// Move the time field one second ahead. The result is a different unit
    /// of work and gets a new id.
    pub fn roll(&mut self, ids: &WorkIds) {
        let ntime = header::ntime(&self.header).wrapping_add(1);
        header::set_ntime(&mut self.header, ntime);
        header::set_nonce(&mut self.header, 0);
        self.rolls += 1;
        self.id = ids.next();
        ShareCounters::bump(&self.pool.stats.local_work);
    }

    fn duplicate(&self, id: u64) -> Self {
        Self {
            id,
            header: self.header,
            midstate: self.midstate,
            target: self.target,
            difficulty: self.difficulty,
            pool: self.pool.clone(),
            protocol: self.protocol,
            mandatory: self.mandatory,
            stale: self.stale,
            clone: self.clone,
            spare: self.spare,
            longpoll: self.longpoll,
            rolls: self.rolls,
            rolltime: self.rolltime,
            created: self.created,
            staged: self.staged,
            cloned_at: self.cloned_at,
            work_restart_id: self.work_restart_id,
            height: self.height,
            device: self.device,
            share_difficulty: self.share_difficulty,
            extension: self.extension.clone(),
        }
    }

    /// Copy for another device. Shares the protocol extension, has its own
    /// id, and looks a second older so the rollable original is preferred.
    pub fn make_clone(&self, ids: &WorkIds) -> Self {
        let now = Instant::now();
        let mut clone = self.duplicate(ids.next());
        clone.clone = true;
        clone.cloned_at = Some(now);
        clone.longpoll = false;
        clone.mandatory = false;
        clone.staged = self
            .staged
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(self.staged);
        clone
    }

    /// Independent copy with the time field one second ahead, for filling
    /// the queue from a single reply.
    pub fn rolled_copy(&self, ids: &WorkIds) -> Self {
        let mut copy = self.duplicate(ids.next());
        copy.longpoll = false;
        copy.mandatory = false;
        copy.roll(ids);
        copy
    }

    /// Copy carrying a found nonce into the submission pipeline.
    pub fn for_share(&self, ids: &WorkIds, nonce: u32, device: Option<usize>) -> Self {
        let mut share = self.duplicate(ids.next());
        header::set_nonce(&mut share.header, nonce);
        share.device = device;
        share
    }
}
