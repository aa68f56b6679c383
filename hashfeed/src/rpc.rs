//! JSON-RPC over HTTP: getwork and getblocktemplate.
//!
//! [`HttpClient`] is the production [`ProtocolClient`]. Each call goes out
//! on a borrowed pool [`Connection`] with basic auth. Replies are decoded by
//! the plain functions below, which the tests exercise directly.

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::pow::{CompactTarget, Target};
use reqwest::header::{HeaderMap, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::pool::{Connection, Pool, Protocol};
use crate::protocol::{ProtocolClient, ProtocolError, RawReply, RawWork};
use crate::tracing::prelude::*;
use crate::work::Work;
use crate::work::header;
use crate::work::template::BlockTemplate;

const USER_AGENT_VALUE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Liveness probes give up sooner than regular fetches.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Longpolls stay open until the pool has something new.
const LONGPOLL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Roll window for pools that answer `X-Roll-NTime: Y`.
const DEFAULT_ROLLTIME: Duration = Duration::from_secs(60);

const ROLL_NTIME: &str = "x-roll-ntime";
const LONG_POLLING: &str = "x-long-polling";
const REJECT_REASON: &str = "x-reject-reason";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Debug, Deserialize)]
pub struct GetworkResult {
    pub data: String,
    pub target: String,
    #[serde(default)]
    pub submitold: bool,
}

#[derive(Debug, Deserialize)]
pub struct TxData {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct TemplateResult {
    pub version: u32,
    pub previousblockhash: String,
    pub bits: String,
    pub curtime: u32,
    pub height: u64,
    pub target: Option<String>,
    pub coinbasetxn: Option<TxData>,
    pub transactions: Option<Vec<TxData>>,
    pub expires: Option<u64>,
    #[serde(default)]
    pub mutable: Vec<String>,
    #[serde(default)]
    pub submitold: bool,
    pub longpolluri: Option<String>,
}

/// Decode an `X-Roll-NTime` value: `Y`, `expire=N`, or anything else for
/// no rolling.
pub fn parse_roll_ntime(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("y") {
        return Some(DEFAULT_ROLLTIME);
    }
    let secs = value
        .strip_prefix("expire=")
        .and_then(|n| n.trim().parse::<u64>().ok())?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, ProtocolError> {
    hex::decode(value).map_err(|e| ProtocolError::Decode(format!("{field}: {e}")))
}

fn decode_hash(field: &str, value: &str) -> Result<[u8; 32], ProtocolError> {
    decode_hex(field, value)?
        .try_into()
        .map_err(|v: Vec<u8>| ProtocolError::Decode(format!("{field}: {} bytes", v.len())))
}

pub fn parse_getwork(
    result: GetworkResult,
    roll_ntime: Option<&str>,
    long_polling: Option<&str>,
) -> Result<RawWork, ProtocolError> {
    let data = decode_hex("data", &result.data)?;
    let header = header::from_getwork_data(&data)
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let target = Target::from_le_bytes(decode_hash("target", &result.target)?);

    let mut raw = RawWork::header(header, target);
    raw.rolltime = roll_ntime.and_then(parse_roll_ntime);
    raw.longpoll_url = long_polling.filter(|url| !url.is_empty()).map(str::to_string);
    raw.submit_old = result.submitold;
    Ok(raw)
}

pub fn parse_template(result: TemplateResult) -> Result<RawWork, ProtocolError> {
    let Some(coinbase) = result.coinbasetxn else {
        return Err(ProtocolError::ProtocolMismatch(
            "template without coinbasetxn".into(),
        ));
    };
    let Some(transactions) = result.transactions else {
        return Err(ProtocolError::ProtocolMismatch(
            "template without transactions".into(),
        ));
    };

    let mut prev_hash = decode_hash("previousblockhash", &result.previousblockhash)?;
    prev_hash.reverse();
    let bits = u32::from_str_radix(&result.bits, 16)
        .map_err(|e| ProtocolError::Decode(format!("bits: {e}")))?;
    let target = match &result.target {
        Some(target) => Target::from_be_bytes(decode_hash("target", target)?),
        None => Target::from_compact(CompactTarget::from_consensus(bits)),
    };
    let coinbase = decode_hex("coinbasetxn", &coinbase.data)?;
    let transactions = transactions
        .iter()
        .map(|tx| decode_hex("transactions", &tx.data))
        .collect::<Result<Vec<_>, _>>()?;

    let template = BlockTemplate::new(
        result.version,
        prev_hash,
        bits,
        result.curtime,
        result.height,
        target,
        coinbase,
        transactions,
        result.mutable.iter().any(|m| m.starts_with("time")),
        result.expires.map(Duration::from_secs),
    );
    let mut raw = RawWork::template(template);
    raw.longpoll_url = result.longpolluri;
    raw.submit_old = result.submitold;
    Ok(raw)
}

/// A share verdict. getwork answers true or false; submitblock answers
/// null on success or a reason string.
pub fn parse_submit_result(result: &Value, reject_reason: Option<&str>) -> RawReply {
    match result {
        Value::Bool(true) | Value::Null => RawReply::accepted(),
        Value::String(reason) => RawReply::rejected(reason.clone()),
        _ => RawReply {
            accepted: false,
            reason: reject_reason.map(str::to_string),
        },
    }
}

fn rpc_error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Debug, Default)]
pub struct HttpClient;

impl HttpClient {
    pub fn new() -> Self {
        Self
    }

    async fn call(
        &self,
        conn: &Connection,
        pool: &Pool,
        url: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<(Value, HeaderMap), ProtocolError> {
        let body = json!({ "id": 0, "method": method, "params": params });
        trace!(conn = conn.id(), pool = pool.number(), method, "RPC request.");

        let response = conn
            .http()
            .post(url)
            .basic_auth(pool.user(), Some(pool.pass()))
            .header(USER_AGENT, USER_AGENT_VALUE)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let reply: RpcResponse = match response.json().await {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                return Err(ProtocolError::Server(format!("HTTP {status}")));
            }
            Err(e) => return Err(e.into()),
        };
        if !reply.error.is_null() {
            return Err(ProtocolError::Server(rpc_error_message(&reply.error)));
        }
        Ok((reply.result, headers))
    }

    async fn getwork(
        &self,
        conn: &Connection,
        pool: &Pool,
        url: &str,
        timeout: Duration,
    ) -> Result<RawWork, ProtocolError> {
        let (result, headers) = self
            .call(conn, pool, url, "getwork", json!([]), timeout)
            .await?;
        let result: GetworkResult =
            serde_json::from_value(result).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        parse_getwork(
            result,
            header_str(&headers, ROLL_NTIME),
            header_str(&headers, LONG_POLLING),
        )
    }

    async fn getblocktemplate(
        &self,
        conn: &Connection,
        pool: &Pool,
        url: &str,
        timeout: Duration,
    ) -> Result<RawWork, ProtocolError> {
        let params = json!([{
            "capabilities": ["coinbasetxn", "workid", "coinbase/append", "longpoll"],
            "rules": ["segwit"],
        }]);
        let (result, _) = self
            .call(conn, pool, url, "getblocktemplate", params, timeout)
            .await
            .map_err(|e| match e {
                // Nodes without the method answer with an RPC error
                ProtocolError::Server(reason) => ProtocolError::ProtocolMismatch(reason),
                e => e,
            })?;
        let result: TemplateResult = serde_json::from_value(result)
            .map_err(|e| ProtocolError::ProtocolMismatch(e.to_string()))?;
        parse_template(result)
    }

    async fn submitblock(
        &self,
        conn: &Connection,
        pool: &Pool,
        block: &[u8],
    ) -> Result<RawReply, ProtocolError> {
        let (result, headers) = self
            .call(
                conn,
                pool,
                pool.url(),
                "submitblock",
                json!([hex::encode(block)]),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(parse_submit_result(&result, header_str(&headers, REJECT_REASON)))
    }
}

#[async_trait]
impl ProtocolClient for HttpClient {
    async fn fetch_work(
        &self,
        conn: &Connection,
        pool: &Pool,
        protocol: Protocol,
        probe: bool,
    ) -> Result<RawWork, ProtocolError> {
        let timeout = if probe { PROBE_TIMEOUT } else { REQUEST_TIMEOUT };
        match protocol {
            Protocol::GetWork => self.getwork(conn, pool, pool.url(), timeout).await,
            Protocol::GetBlockTemplate => {
                self.getblocktemplate(conn, pool, pool.url(), timeout).await
            }
            Protocol::Stratum => Err(ProtocolError::Unsupported),
        }
    }

    async fn submit_work(
        &self,
        conn: &Connection,
        pool: &Pool,
        work: &Work,
    ) -> Result<RawReply, ProtocolError> {
        match work.protocol {
            Protocol::GetWork => {
                let data = hex::encode(header::to_getwork_data(&work.header));
                let (result, headers) = self
                    .call(conn, pool, pool.url(), "getwork", json!([data]), REQUEST_TIMEOUT)
                    .await?;
                Ok(parse_submit_result(&result, header_str(&headers, REJECT_REASON)))
            }
            Protocol::GetBlockTemplate => {
                let template = work.template().ok_or_else(|| {
                    ProtocolError::Decode("template work without its template".into())
                })?;
                self.submitblock(conn, pool, &template.block_bytes(&work.header))
                    .await
            }
            Protocol::Stratum => Err(ProtocolError::Unsupported),
        }
    }

    async fn longpoll(
        &self,
        conn: &Connection,
        pool: &Pool,
        url: &str,
    ) -> Result<RawWork, ProtocolError> {
        match pool.protocol() {
            Protocol::GetWork => self.getwork(conn, pool, url, LONGPOLL_TIMEOUT).await,
            Protocol::GetBlockTemplate => {
                self.getblocktemplate(conn, pool, url, LONGPOLL_TIMEOUT).await
            }
            Protocol::Stratum => Err(ProtocolError::Unsupported),
        }
    }

    async fn submit_block(
        &self,
        conn: &Connection,
        pool: &Pool,
        block: &[u8],
    ) -> Result<RawReply, ProtocolError> {
        self.submitblock(conn, pool, block).await
    }
}
