//! Error types shared across the crate.
//!
//! Each concern has its own enum; [`Error`] wraps them for callers that
//! cross module boundaries. Pool-level failures are absorbed by the liveness
//! state machine and rarely surface past the scheduler.

use thiserror::Error;

pub use crate::protocol::ProtocolError;
pub use crate::work::WorkError;

/// Configuration problems. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No pools configured")]
    NoPools,

    #[error("Pool {0} has an empty URL")]
    EmptyUrl(usize),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Pool registry failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No enabled pool can serve the request. Distinct from the transient
    /// case where enabled pools exist but are all idle.
    #[error("No usable pool")]
    NoUsablePool,

    #[error("Unknown pool {0}")]
    UnknownPool(usize),

    #[error("Pool {0} is the last remaining pool")]
    LastPool(usize),

    #[error("Pool {0} is the active pool")]
    ActivePool(usize),

    #[error("Pool was removed")]
    Removed,
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Work(#[from] WorkError),

    #[error("Shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
