//! Backing-store primitives used by the queue.
//!
//! Everything the client and dispatcher need from the store is expressed by
//! the [`Conn`] trait: an atomic counter, hash records, lists with a
//! multi-key blocking pop, and a score-ordered set. [`RedisConn`] speaks to
//! Redis; [`MemoryStore`] keeps the same structures in process.

mod memory;
mod redis_store;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use self::memory::{MemoryConn, MemoryStore};
pub use self::redis_store::{RedisConn, RedisConnector};

const DEFAULT_MAX_IDLE: usize = 64;

/// Score bounds for a sorted-set range query, with `LIMIT offset count`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
    pub offset: usize,
    pub count: usize,
}

impl ScoreRange {
    /// Members scored at or below `max`, lowest first.
    pub fn up_to(max: f64, count: usize) -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max,
            min_inclusive: true,
            max_inclusive: true,
            offset: 0,
            count,
        }
    }

    pub fn contains(&self, score: f64) -> bool {
        let above_min = if self.min_inclusive {
            score >= self.min
        } else {
            score > self.min
        };
        let below_max = if self.max_inclusive {
            score <= self.max
        } else {
            score < self.max
        };
        above_min && below_max
    }
}

#[async_trait]
pub trait Conn: Send {
    /// Increment a counter and return the new value.
    async fn incr(&mut self, key: &str) -> Result<i64>;

    /// All fields of a hash; empty when the key does not exist.
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>>;

    async fn hset_all(&mut self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Append to the tail of a list and return its new length.
    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<i64>;

    /// Pop the head of the first non-empty list in `keys`, waiting up to
    /// `timeout` for one to fill. Returns the source key and the value.
    async fn blpop(
        &mut self,
        timeout: Duration,
        keys: &[String],
    ) -> Result<Option<(String, String)>>;

    /// Add `member` only if it is not already in the set. Returns the number
    /// of members added.
    async fn zadd_nx(&mut self, key: &str, score: f64, member: &str) -> Result<i64>;

    /// Remove `member`, returning how many members were actually removed.
    async fn zrem(&mut self, key: &str, member: &str) -> Result<i64>;

    async fn zrange_by_score(&mut self, key: &str, range: ScoreRange) -> Result<Vec<String>>;

    /// Whether the connection can go back into a pool after use.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Opens new connections for a [`ConnPool`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Conn>>;
}

/// Idle connections kept for reuse. A blocking pop occupies its connection
/// for the whole wait, so each concurrent caller checks out its own.
pub struct ConnPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn Conn>>>,
    max_idle: usize,
}

impl ConnPool {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
        })
    }

    pub async fn get(self: &Arc<Self>) -> Result<PooledConn> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.connector.connect().await?,
        };
        Ok(PooledConn {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }

    fn put(&self, conn: Box<dyn Conn>) {
        if !conn.is_reusable() {
            tracing::debug!("dropping broken store connection");
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

/// A checked-out connection; returns itself to the pool on drop.
pub struct PooledConn {
    conn: Option<Box<dyn Conn>>,
    pool: Arc<ConnPool>,
}

impl Deref for PooledConn {
    type Target = dyn Conn;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection used after release")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection used after release")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}
