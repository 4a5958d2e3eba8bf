//! # Blocking Client API
//!
//! Purpose: A compact, blocking facade for issuing Ember commands over
//! pooled RESP2 connections. Works against a cache node or the routing
//! proxy; the wire contract is identical.

use std::time::Duration;

use thiserror::Error;

use crate::pool::{ConnectionPool, PoolConfig};
use crate::resp::{parse_f64, RespValue};

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error")]
    Protocol,

    #[error("server error: {}", String::from_utf8_lossy(message))]
    Server { message: Vec<u8> },

    #[error("unexpected response shape")]
    UnexpectedResponse,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("invalid address")]
    InvalidAddress,
}

/// TTL state of a key, mirroring the wire's `-2` / `-1` / seconds reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    Missing,
    NoExpiry,
    ExpiresIn(Duration),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:7001".
    pub addr: String,
    pub max_idle: usize,
    pub max_total: usize,
    /// Idle connections older than this are not reused.
    pub max_idle_age: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:7001".to_string(),
            max_idle: 8,
            max_total: 16,
            max_idle_age: Some(Duration::from_secs(300)),
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

/// Blocking client with connection pooling.
///
/// Each call acquires a pooled connection, runs one command, and returns
/// the connection on drop.
pub struct EmberClient {
    pool: ConnectionPool,
}

impl EmberClient {
    /// Connects with default pool settings.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        })
    }

    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            addr: config.addr,
            max_idle: config.max_idle,
            max_total: config.max_total,
            max_idle_age: config.max_idle_age,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            connect_timeout: config.connect_timeout,
        })?;
        Ok(EmberClient { pool })
    }

    fn exec(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut conn = self.pool.acquire()?;
        conn.exec(args)
    }

    // ------------------------------------------------------------------
    // Strings and TTL
    // ------------------------------------------------------------------

    pub fn ping(&self) -> ClientResult<Vec<u8>> {
        match self.exec(&[b"PING"])?.into_result()? {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn info(&self) -> ClientResult<Vec<u8>> {
        self.exec(&[b"INFO"])?
            .into_bulk()?
            .ok_or(ClientError::UnexpectedResponse)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        self.exec(&[b"SET", key, value])?.into_simple().map(|_| ())
    }

    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let seconds = ttl.as_secs().to_string();
        self.exec(&[b"SET", key, value, b"EX", seconds.as_bytes()])?
            .into_simple()
            .map(|_| ())
    }

    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        self.exec(&[b"GET", key])?.into_bulk()
    }

    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        Ok(self.exec(&[b"DEL", key])?.into_integer()? > 0)
    }

    pub fn exists(&self, key: &[u8]) -> ClientResult<bool> {
        Ok(self.exec(&[b"EXISTS", key])?.into_integer()? == 1)
    }

    pub fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let seconds = ttl.as_secs().to_string();
        Ok(self
            .exec(&[b"EXPIRE", key, seconds.as_bytes()])?
            .into_integer()?
            == 1)
    }

    pub fn persist(&self, key: &[u8]) -> ClientResult<bool> {
        Ok(self.exec(&[b"PERSIST", key])?.into_integer()? == 1)
    }

    pub fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        match self.exec(&[b"TTL", key])?.into_integer()? {
            -2 => Ok(ClientTtl::Missing),
            -1 => Ok(ClientTtl::NoExpiry),
            seconds if seconds >= 0 => Ok(ClientTtl::ExpiresIn(Duration::from_secs(
                seconds as u64,
            ))),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn flush(&self) -> ClientResult<()> {
        self.exec(&[b"FLUSH"])?.into_simple().map(|_| ())
    }

    // ------------------------------------------------------------------
    // Sorted sets
    // ------------------------------------------------------------------

    /// Returns true when the member was newly added.
    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> ClientResult<bool> {
        let score = score.to_string();
        Ok(self
            .exec(&[b"ZADD", key, score.as_bytes(), member])?
            .into_integer()?
            == 1)
    }

    pub fn zrem(&self, key: &[u8], member: &[u8]) -> ClientResult<bool> {
        Ok(self.exec(&[b"ZREM", key, member])?.into_integer()? == 1)
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> ClientResult<Option<f64>> {
        match self.exec(&[b"ZSCORE", key, member])?.into_bulk()? {
            Some(bulk) => Ok(Some(parse_f64(&bulk)?)),
            None => Ok(None),
        }
    }

    pub fn zrank(&self, key: &[u8], member: &[u8]) -> ClientResult<Option<i64>> {
        rank_reply(self.exec(&[b"ZRANK", key, member])?)
    }

    pub fn zrev_rank(&self, key: &[u8], member: &[u8]) -> ClientResult<Option<i64>> {
        rank_reply(self.exec(&[b"ZREVRANK", key, member])?)
    }

    pub fn zcard(&self, key: &[u8]) -> ClientResult<i64> {
        self.exec(&[b"ZCARD", key])?.into_integer()
    }

    pub fn zincr_by(&self, key: &[u8], delta: f64, member: &[u8]) -> ClientResult<f64> {
        let delta = delta.to_string();
        self.exec(&[b"ZINCRBY", key, delta.as_bytes(), member])?
            .into_score()
    }

    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> ClientResult<Vec<Vec<u8>>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        members_reply(self.exec(&[b"ZRANGE", key, start.as_bytes(), stop.as_bytes()])?)
    }

    pub fn zrange_with_scores(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> ClientResult<Vec<(Vec<u8>, f64)>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        scored_reply(self.exec(&[
            b"ZRANGE",
            key,
            start.as_bytes(),
            stop.as_bytes(),
            b"WITHSCORES",
        ])?)
    }

    pub fn zrev_range(&self, key: &[u8], start: i64, stop: i64) -> ClientResult<Vec<Vec<u8>>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        members_reply(self.exec(&[b"ZREVRANGE", key, start.as_bytes(), stop.as_bytes()])?)
    }

    pub fn zrange_by_score(&self, key: &[u8], min: f64, max: f64) -> ClientResult<Vec<Vec<u8>>> {
        let (min, max) = (min.to_string(), max.to_string());
        members_reply(self.exec(&[b"ZRANGEBYSCORE", key, min.as_bytes(), max.as_bytes()])?)
    }
}

fn rank_reply(value: RespValue) -> ClientResult<Option<i64>> {
    match value.into_result()? {
        RespValue::Integer(rank) => Ok(Some(rank)),
        RespValue::Bulk(None) => Ok(None),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn members_reply(value: RespValue) -> ClientResult<Vec<Vec<u8>>> {
    value
        .into_array()?
        .into_iter()
        .map(|item| {
            item.into_bulk()?
                .ok_or(ClientError::UnexpectedResponse)
        })
        .collect()
}

fn scored_reply(value: RespValue) -> ClientResult<Vec<(Vec<u8>, f64)>> {
    let items = value.into_array()?;
    if items.len() % 2 != 0 {
        return Err(ClientError::UnexpectedResponse);
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
        let member = member
            .into_bulk()?
            .ok_or(ClientError::UnexpectedResponse)?;
        let score = score.into_score()?;
        out.push((member, score));
    }
    Ok(out)
}
