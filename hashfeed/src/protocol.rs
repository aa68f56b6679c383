//! The boundary with work protocol clients.
//!
//! Wire formats are somebody else's problem. A [`ProtocolClient`] turns
//! getwork and getblocktemplate exchanges into [`RawWork`] and [`RawReply`];
//! a [`StratumTransport`] owns the stratum socket. The core decides when to
//! call them and for which pool.

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::pow::Target;
use thiserror::Error;

use crate::pool::{Connection, Pool, Protocol};
use crate::work::Work;
use crate::work::header::Header;
use crate::work::stratum::StratumSubmit;
use crate::work::template::BlockTemplate;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed reply: {0}")]
    Decode(String),

    /// The pool answered but not in the protocol we asked for.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Not supported by this client")]
    Unsupported,

    #[error("Pool returned an error: {0}")]
    Server(String),
}

impl ProtocolError {
    /// Worth retrying against the same pool.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Network(_) | ProtocolError::Timeout)
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProtocolError::Timeout
        } else if e.is_decode() {
            ProtocolError::Decode(e.to_string())
        } else {
            ProtocolError::Network(e.to_string())
        }
    }
}

#[derive(Debug)]
pub enum RawPayload {
    /// A ready header and share target (getwork).
    Header { header: Header, target: Target },
    /// A full block template (getblocktemplate).
    Template(BlockTemplate),
}

/// A decoded work reply.
#[derive(Debug)]
pub struct RawWork {
    pub payload: RawPayload,
    /// How long the pool allows the time field to be rolled, if at all.
    pub rolltime: Option<Duration>,
    /// Where to send longpoll requests, if the pool supports them.
    pub longpoll_url: Option<String>,
    /// Pool accepts shares from before its last restart.
    pub submit_old: bool,
}

impl RawWork {
    pub fn header(header: Header, target: Target) -> Self {
        Self {
            payload: RawPayload::Header { header, target },
            rolltime: None,
            longpoll_url: None,
            submit_old: false,
        }
    }

    pub fn template(template: BlockTemplate) -> Self {
        Self {
            payload: RawPayload::Template(template),
            rolltime: None,
            longpoll_url: None,
            submit_old: false,
        }
    }
}

/// A pool's verdict on a submitted share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    pub accepted: bool,
    /// Rejection reason as the pool stated it.
    pub reason: Option<String>,
}

impl RawReply {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Request/response work protocols over HTTP.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Fetch one unit of work. `probe` marks liveness tests, which clients
    /// may answer with shorter timeouts.
    async fn fetch_work(
        &self,
        conn: &Connection,
        pool: &Pool,
        protocol: Protocol,
        probe: bool,
    ) -> Result<RawWork, ProtocolError>;

    async fn submit_work(
        &self,
        conn: &Connection,
        pool: &Pool,
        work: &Work,
    ) -> Result<RawReply, ProtocolError>;

    /// Long-lived request that completes when the pool has new work.
    async fn longpoll(
        &self,
        conn: &Connection,
        pool: &Pool,
        url: &str,
    ) -> Result<RawWork, ProtocolError>;

    /// Hand a solved block straight to a node.
    async fn submit_block(
        &self,
        _conn: &Connection,
        _pool: &Pool,
        _block: &[u8],
    ) -> Result<RawReply, ProtocolError> {
        Err(ProtocolError::Unsupported)
    }
}

/// The stratum socket layer, as far as share submission goes. Replies come
/// back through [`crate::context::MiningContext::on_stratum_reply`].
#[async_trait]
pub trait StratumTransport: Send + Sync {
    /// Send `mining.submit`, tagged with `share_id` for reply correlation.
    async fn submit(
        &self,
        pool: &Pool,
        share_id: u64,
        submit: &StratumSubmit,
    ) -> Result<(), ProtocolError>;

    /// Whether the session can be resumed after a disconnect, so that
    /// shares awaiting a reply may be sent again.
    fn resumable(&self, pool: &Pool) -> bool;
}

/// Transport for builds without a stratum socket layer. Every send fails.
#[derive(Debug, Default)]
pub struct NoStratumTransport;

#[async_trait]
impl StratumTransport for NoStratumTransport {
    async fn submit(
        &self,
        _pool: &Pool,
        _share_id: u64,
        _submit: &StratumSubmit,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported)
    }

    fn resumable(&self, _pool: &Pool) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ProtocolError::Network("reset".into()), true)]
    #[test_case(ProtocolError::Timeout, true)]
    #[test_case(ProtocolError::Decode("eof".into()), false)]
    #[test_case(ProtocolError::ProtocolMismatch("no coinbasetxn".into()), false)]
    #[test_case(ProtocolError::Server("low difficulty".into()), false)]
    fn test_transient(error: ProtocolError, transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }
}
