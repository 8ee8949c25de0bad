use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::{Conn, Connector, ScoreRange};

// BLPOP treats a zero timeout as "block forever".
const MIN_BLOCKING_TIMEOUT_SECONDS: f64 = 0.01;

fn summarize_redis_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else if host.is_empty() {
        format!("{scheme}://")
    } else {
        format!("{scheme}://{host}")
    }
}

fn redis_connect_context(dsn: &str) -> String {
    let summary = summarize_redis_dsn(dsn);
    if summary.is_empty() {
        "failed to connect to Redis".to_string()
    } else {
        format!("failed to connect to Redis ({summary})")
    }
}

fn format_score(score: f64, inclusive: bool) -> String {
    let value = if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    };
    if inclusive {
        value
    } else {
        format!("({value}")
    }
}

/// Opens one multiplexed Redis connection per pooled slot.
#[derive(Clone)]
pub struct RedisConnector {
    dsn: String,
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(dsn: impl Into<String>) -> Result<Self> {
        let dsn = dsn.into();
        let client = redis::Client::open(dsn.as_str()).with_context(|| {
            format!(
                "failed to create Redis client ({})",
                summarize_redis_dsn(&dsn)
            )
        })?;
        Ok(Self { dsn, client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn Conn>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| anyhow::Error::new(err).context(redis_connect_context(&self.dsn)))?;
        Ok(Box::new(RedisConn::new(conn)))
    }
}

pub struct RedisConn {
    conn: MultiplexedConnection,
    broken: bool,
}

impl RedisConn {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            broken: false,
        }
    }

    fn track<T>(&mut self, result: redis::RedisResult<T>) -> Result<T> {
        result.map_err(|err| {
            if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
                self.broken = true;
            }
            anyhow::Error::new(err)
        })
    }
}

#[async_trait]
impl Conn for RedisConn {
    async fn incr(&mut self, key: &str) -> Result<i64> {
        let result = self.conn.incr::<_, _, i64>(key, 1i64).await;
        self.track(result)
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        let result = self.conn.hgetall::<_, HashMap<String, String>>(key).await;
        self.track(result)
    }

    async fn hset_all(&mut self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let result = self.conn.hset_multiple::<_, _, _, ()>(key, fields).await;
        self.track(result)
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<i64> {
        let result = self.conn.rpush::<_, _, i64>(key, values).await;
        self.track(result)
    }

    async fn blpop(
        &mut self,
        timeout: Duration,
        keys: &[String],
    ) -> Result<Option<(String, String)>> {
        let seconds = timeout.as_secs_f64().max(MIN_BLOCKING_TIMEOUT_SECONDS);
        let result = redis::cmd("BLPOP")
            .arg(keys)
            .arg(seconds)
            .query_async::<Option<(String, String)>>(&mut self.conn)
            .await;
        self.track(result)
    }

    async fn zadd_nx(&mut self, key: &str, score: f64, member: &str) -> Result<i64> {
        let result = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async::<i64>(&mut self.conn)
            .await;
        self.track(result)
    }

    async fn zrem(&mut self, key: &str, member: &str) -> Result<i64> {
        let result = self.conn.zrem::<_, _, i64>(key, member).await;
        self.track(result)
    }

    async fn zrange_by_score(&mut self, key: &str, range: ScoreRange) -> Result<Vec<String>> {
        let result = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(format_score(range.min, range.min_inclusive))
            .arg(format_score(range.max, range.max_inclusive))
            .arg("LIMIT")
            .arg(range.offset)
            .arg(range.count)
            .query_async::<Vec<String>>(&mut self.conn)
            .await;
        self.track(result)
    }

    fn is_reusable(&self) -> bool {
        !self.broken
    }
}
