//! # Node Connection
//!
//! One long-lived connection per cache node, owned by a small actor task.
//! Commands queue through a channel and run strictly one at a time, which
//! gives per-key issue-order on a single proxy for free.
//!
//! State machine: Disconnected -> Connecting -> Connected, back to
//! Disconnected on any IO error, with capped exponential backoff between
//! connect attempts. While backing off, queued requests fail fast so
//! dispatch can move to the next replica instead of waiting out the cap.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use ember_common::resp;
use ember_common::{EmberError, EmberResult, NodeId};

/// Connection and retry knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => ConnState::Connected,
            1 => ConnState::Connecting,
            _ => ConnState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnState::Disconnected => 0,
            ConnState::Connecting => 1,
            ConnState::Connected => 2,
        }
    }
}

struct Request {
    frame: Vec<u8>,
    reply: oneshot::Sender<EmberResult<Vec<u8>>>,
}

/// Handle to one node's connection actor.
pub struct NodeConnection {
    node_id: NodeId,
    addr: String,
    tx: mpsc::Sender<Request>,
    state: Arc<AtomicU8>,
    task: tokio::task::JoinHandle<()>,
}

impl NodeConnection {
    /// Spawns the actor; it connects lazily and retries with backoff.
    pub fn spawn(node_id: NodeId, addr: String, config: ConnectionConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let state = Arc::new(AtomicU8::new(ConnState::Disconnected.as_u8()));
        let task = tokio::spawn(actor(
            node_id.clone(),
            addr.clone(),
            rx,
            Arc::clone(&state),
            config,
        ));
        Arc::new(NodeConnection {
            node_id,
            addr,
            tx,
            state,
            task,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sends one framed command and awaits its framed reply.
    pub async fn request(&self, frame: Vec<u8>) -> EmberResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| closed_error())?;
        reply_rx.await.map_err(|_| closed_error())?
    }

    /// Tears the actor down; pending requests error out.
    pub fn close(&self) {
        self.task.abort();
        self.state
            .store(ConnState::Disconnected.as_u8(), Ordering::Release);
    }
}

fn closed_error() -> EmberError {
    EmberError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "node connection closed",
    ))
}

fn disconnected_error(addr: &str) -> EmberError {
    EmberError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{addr} is down"),
    ))
}

enum ServeEnd {
    /// All senders dropped; the actor is done for good.
    Closed,
    IoError(String),
}

async fn actor(
    node_id: NodeId,
    addr: String,
    mut rx: mpsc::Receiver<Request>,
    state: Arc<AtomicU8>,
    config: ConnectionConfig,
) {
    let mut backoff = config.initial_backoff;
    loop {
        state.store(ConnState::Connecting.as_u8(), Ordering::Release);
        let connected =
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await;

        match connected {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                state.store(ConnState::Connected.as_u8(), Ordering::Release);
                backoff = config.initial_backoff;
                tracing::info!(node = %node_id, %addr, "node connection established");

                match serve(stream, &mut rx, config.request_timeout).await {
                    ServeEnd::Closed => {
                        state.store(ConnState::Disconnected.as_u8(), Ordering::Release);
                        return;
                    }
                    ServeEnd::IoError(msg) => {
                        state.store(ConnState::Disconnected.as_u8(), Ordering::Release);
                        tracing::warn!(node = %node_id, %addr, %msg, "node connection lost");
                    }
                }
            }
            Ok(Err(err)) => {
                state.store(ConnState::Disconnected.as_u8(), Ordering::Release);
                tracing::warn!(node = %node_id, %addr, error = %err, "connect failed");
            }
            Err(_) => {
                state.store(ConnState::Disconnected.as_u8(), Ordering::Release);
                tracing::warn!(node = %node_id, %addr, "connect timed out");
            }
        }

        // Fail queued requests fast for the whole backoff window.
        let deadline = tokio::time::Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                request = rx.recv() => match request {
                    Some(request) => {
                        let _ = request.reply.send(Err(disconnected_error(&addr)));
                    }
                    None => return,
                },
            }
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

async fn serve(
    mut stream: TcpStream,
    rx: &mut mpsc::Receiver<Request>,
    request_timeout: Duration,
) -> ServeEnd {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    while let Some(request) = rx.recv().await {
        match tokio::time::timeout(
            request_timeout,
            exchange(&mut stream, &mut buffer, &request.frame),
        )
        .await
        {
            Ok(Ok(reply)) => {
                let _ = request.reply.send(Ok(reply));
            }
            Ok(Err(err)) => {
                let msg = err.to_string();
                let _ = request.reply.send(Err(err));
                return ServeEnd::IoError(msg);
            }
            Err(_) => {
                // A timed-out exchange leaves the stream mid-reply; the
                // only safe move is a reconnect.
                let _ = request.reply.send(Err(EmberError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "node request timed out",
                ))));
                return ServeEnd::IoError("request timed out".to_string());
            }
        }
    }
    ServeEnd::Closed
}

async fn exchange(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    frame: &[u8],
) -> EmberResult<Vec<u8>> {
    stream.write_all(frame).await?;
    loop {
        if let Some(len) = resp::reply_len(buffer)
            .map_err(|_| EmberError::Protocol("bad reply framing".to_string()))?
        {
            return Ok(buffer.split_to(len).to_vec());
        }
        let read = stream.read_buf(buffer).await?;
        if read == 0 {
            return Err(EmberError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "node closed connection",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal RESP echo node: answers every command with +OK.
    async fn spawn_stub_node() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buffer = BytesMut::new();
                    let mut parser = resp::CommandParser::new();
                    loop {
                        let Ok(read) = stream.read_buf(&mut buffer).await else {
                            return;
                        };
                        if read == 0 {
                            return;
                        }
                        while let Ok(Some(_)) = parser.parse(&mut buffer) {
                            if stream.write_all(b"+OK\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        }
    }

    fn frame(args: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        resp::encode_command(args, &mut out);
        out
    }

    #[tokio::test]
    async fn request_roundtrip_and_connected_state() {
        let addr = spawn_stub_node().await;
        let conn = NodeConnection::spawn(NodeId::from("n1"), addr, fast_config());

        let reply = conn.request(frame(&[b"PING"])).await.unwrap();
        assert_eq!(reply, b"+OK\r\n");
        assert_eq!(conn.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn down_node_fails_fast_during_backoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = NodeConnection::spawn(NodeId::from("n1"), addr, fast_config());
        let result = conn.request(frame(&[b"PING"])).await;
        assert!(result.is_err());
        assert_ne!(conn.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn reconnects_after_listener_returns() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = NodeConnection::spawn(NodeId::from("n1"), addr.clone(), fast_config());
        assert!(conn.request(frame(&[b"PING"])).await.is_err());

        // Bring a stub node up on the same port.
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            let mut parser = resp::CommandParser::new();
            loop {
                let Ok(read) = stream.read_buf(&mut buffer).await else {
                    return;
                };
                if read == 0 {
                    return;
                }
                while let Ok(Some(_)) = parser.parse(&mut buffer) {
                    let _ = stream.write_all(b"+OK\r\n").await;
                }
            }
        });

        // Give the backoff loop a couple of cycles to reconnect.
        let mut reply = Err(closed_error());
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            reply = conn.request(frame(&[b"PING"])).await;
            if reply.is_ok() {
                break;
            }
        }
        assert_eq!(reply.unwrap(), b"+OK\r\n");
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let addr = spawn_stub_node().await;
        let conn = NodeConnection::spawn(NodeId::from("n1"), addr, fast_config());
        conn.request(frame(&[b"PING"])).await.unwrap();

        conn.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.request(frame(&[b"PING"])).await.is_err());
        assert_eq!(conn.state(), ConnState::Disconnected);
    }
}
