//! Per-pool HTTP connection handles.
//!
//! Each pool keeps a free list of connections. Requests borrow one with
//! [`ConnectionPool::pop`] and hand it back with [`ConnectionPool::push`].
//! New handles are recruited on demand up to a cap; when the cap is reached
//! callers wait for a handle to come back. The pool watcher reaps handles
//! that have sat unused for a while.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::protocol::ProtocolError;
use crate::tracing::prelude::*;

/// Idle time after which a free handle is closed.
pub const REAP_AFTER: Duration = Duration::from_secs(300);

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection cap for a pool: `max(5, 2 * (threads + queue))`, or a flat 5
/// when network delay mode is on.
pub fn connection_cap(mining_threads: usize, queue: usize, delaynet: bool) -> usize {
    if delaynet {
        5
    } else {
        (2 * (mining_threads + queue)).max(5)
    }
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    last_used: Instant,
    http: reqwest::Client,
}

impl Connection {
    fn open(proxy: Option<&str>) -> Result<Self, ProtocolError> {
        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ProtocolError::Network(format!("bad proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| ProtocolError::Network(e.to_string()))?;
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            last_used: Instant::now(),
            http,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

#[derive(Debug, Default)]
struct Handles {
    free: Vec<Connection>,
    /// Handles in existence, free or borrowed.
    total: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionPool {
    handles: Mutex<Handles>,
    returned: Notify,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a handle, recruiting one if under `cap`, else waiting.
    pub async fn pop(&self, cap: usize, proxy: Option<&str>) -> Result<Connection, ProtocolError> {
        loop {
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            {
                let mut handles = self.handles.lock();
                if let Some(conn) = handles.free.pop() {
                    return Ok(conn);
                }
                if handles.total < cap.max(1) {
                    handles.total += 1;
                    drop(handles);
                    return Connection::open(proxy).inspect_err(|_| {
                        self.handles.lock().total -= 1;
                    });
                }
            }

            trace!(cap, "Connection cap reached, waiting for a free handle.");
            returned.await;
        }
    }

    /// Return a borrowed handle.
    pub fn push(&self, mut conn: Connection) {
        conn.last_used = Instant::now();
        self.handles.lock().free.push(conn);
        self.returned.notify_one();
    }

    /// Close free handles unused for [`REAP_AFTER`], always keeping one.
    pub fn reap(&self) -> usize {
        let mut handles = self.handles.lock();
        let now = Instant::now();
        let before = handles.free.len();
        let mut kept_one = false;
        // Free list is LIFO; the most recently used handle is last.
        let mut kept: Vec<Connection> = Vec::with_capacity(before);
        while let Some(conn) = handles.free.pop() {
            if !kept_one || now.duration_since(conn.last_used) < REAP_AFTER {
                kept_one = true;
                kept.push(conn);
            }
        }
        kept.reverse();
        handles.free = kept;
        let reaped = before - handles.free.len();
        handles.total -= reaped;
        reaped
    }

    pub fn total(&self) -> usize {
        self.handles.lock().total
    }

    pub fn free(&self) -> usize {
        self.handles.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_case::test_case;

    #[test_case(4, 1, false, 10; "scales with threads")]
    #[test_case(0, 1, false, 5; "floor of five")]
    #[test_case(40, 10, true, 5; "delaynet fixed")]
    fn test_connection_cap(threads: usize, queue: usize, delaynet: bool, expected: usize) {
        assert_eq!(connection_cap(threads, queue, delaynet), expected);
    }

    #[tokio::test]
    async fn test_recruits_up_to_cap_then_reuses() {
        let pool = ConnectionPool::new();
        let a = pool.pop(2, None).await.unwrap();
        let b = pool.pop(2, None).await.unwrap();
        assert_eq!(pool.total(), 2);

        let a_id = a.id();
        pool.push(a);
        let c = pool.pop(2, None).await.unwrap();
        assert_eq!(c.id(), a_id, "free handle reused before recruiting");
        assert_eq!(pool.total(), 2);

        pool.push(b);
        pool.push(c);
        assert_eq!(pool.free(), 2);
    }

    #[tokio::test]
    async fn test_waits_at_cap() {
        let pool = Arc::new(ConnectionPool::new());
        let held = pool.pop(1, None).await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pop(1, None).await.map(|c| c.id()) }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "must wait while at cap");

        let held_id = held.id();
        pool.push(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_keeps_one() {
        let pool = ConnectionPool::new();
        let a = pool.pop(5, None).await.unwrap();
        let b = pool.pop(5, None).await.unwrap();
        let c = pool.pop(5, None).await.unwrap();
        pool.push(a);
        pool.push(b);
        pool.push(c);

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(pool.reap(), 0);

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(pool.reap(), 2);
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.free(), 1);
    }
}
