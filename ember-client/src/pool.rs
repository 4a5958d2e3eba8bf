//! # Connection Pool
//!
//! Purpose: Reuse TCP connections for the blocking client to avoid
//! per-command handshakes.
//!
//! ## Design Principles
//! 1. **Object Pool**: A bounded set of reusable connections; exceeding
//!    the limit fails fast instead of queueing.
//! 2. **Minimal Locking**: The mutex guards only the idle queue and the
//!    slot count, never IO.
//! 3. **Stale Idle Culling**: Idle connections past `max_idle_age` are
//!    dropped on acquire rather than handed to a caller who would then eat
//!    the reconnect as a command failure.
//! 4. **Invalidate On Error**: A connection that saw an IO or protocol
//!    error never returns to the pool.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::client::{ClientError, ClientResult};
use crate::resp::{encode_command, read_response, RespValue};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:7001".
    pub addr: String,
    /// Maximum idle connections kept around.
    pub max_idle: usize,
    /// Maximum total connections (idle + in use).
    pub max_total: usize,
    /// Idle connections older than this are discarded on acquire.
    pub max_idle_age: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

struct IdleEntry {
    conn: Connection,
    parked_at: Instant,
}

struct PoolState {
    idle: VecDeque<IdleEntry>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Shared pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        })
    }

    /// Hands out an idle connection or opens a new one within the limit.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.pop_live_idle() {
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        if !self.try_reserve() {
            return Err(ClientError::PoolExhausted);
        }
        match Connection::connect(&self.inner.config) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Pops idle connections, discarding any that aged out.
    fn pop_live_idle(&self) -> Option<Connection> {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        let max_age = self.inner.config.max_idle_age;
        while let Some(entry) = state.idle.pop_front() {
            let stale = max_age.is_some_and(|age| entry.parked_at.elapsed() > age);
            if stale {
                state.total = state.total.saturating_sub(1);
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if state.total >= self.inner.config.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        state.total = state.total.saturating_sub(1);
    }

    fn park(&self, conn: Connection) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(IdleEntry {
                conn,
                parked_at: Instant::now(),
            });
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// RAII wrapper returning the connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes one command and parses the reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = self.conn.as_mut().expect("connection present");
        let response = conn.exec(args);
        if response.is_err() {
            // Do not return a possibly desynced stream to the pool.
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };
        if self.valid {
            pool.park(conn);
        } else {
            pool.release_slot();
        }
    }
}

/// One TCP connection with reusable buffers.
struct Connection {
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn connect(config: &PoolConfig) -> ClientResult<Self> {
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|_| ClientError::InvalidAddress)?;
        let stream = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        // Small command/reply pairs; latency beats batching here.
        stream.set_nodelay(true)?;

        Ok(Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        })
    }

    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }
}
