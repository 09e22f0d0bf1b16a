//! A single TCP peer: shared write handle, capability systems, and the
//! read half driven by its owner's receive loop.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::BufferPool;
use crate::codec::FrameCodec;
use crate::error::TetherError;
use crate::systems::{CommandSystem, ComponentSystem, EventSystem, Systems, TaskSystem};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ── ConnectionInfo ───────────────────────────────────────────────

/// Address of a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    ip: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

impl From<SocketAddr> for ConnectionInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

// ── Connection ───────────────────────────────────────────────────

/// Cloneable handle to one live TCP connection.
///
/// Clones share the same socket, systems and close state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    peer_addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    systems: Systems,
    closed: AtomicBool,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl Connection {
    /// Split `stream` into a shared handle and the reader for its receive loop.
    pub fn from_stream(
        stream: TcpStream,
        pool: BufferPool,
    ) -> Result<(Connection, ConnectionReader), TetherError> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                writer: Mutex::new(Some(writer)),
                systems: Systems::new(),
                closed: AtomicBool::new(false),
                cancel: cancel.clone(),
                connected_at: Instant::now(),
            }),
        };
        let reader = ConnectionReader {
            id: connection.id(),
            reader,
            codec: FrameCodec::new(),
            buffer: BytesMut::new(),
            pool,
            cancel,
        };
        Ok((connection, reader))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.peer_addr.ip()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo::from(self.inner.peer_addr)
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    // ── Systems ──────────────────────────────────────────────────

    pub fn systems(&self) -> &Systems {
        &self.inner.systems
    }

    pub fn components(&self) -> &ComponentSystem {
        &self.inner.systems.components
    }

    pub fn events(&self) -> &EventSystem {
        &self.inner.systems.events
    }

    pub fn tasks(&self) -> &TaskSystem {
        &self.inner.systems.tasks
    }

    pub fn commands(&self) -> &CommandSystem {
        &self.inner.systems.commands
    }

    // ── Writing ──────────────────────────────────────────────────

    /// Frame `payload` into a pooled buffer and write it.
    pub async fn write_frame(&self, payload: &[u8], pool: &BufferPool) -> Result<(), TetherError> {
        let mut frame = pool.rent();
        FrameCodec::new().encode(payload, &mut *frame)?;
        self.write_encoded(&frame).await
    }

    /// Write bytes that are already framed.
    pub async fn write_encoded(&self, frame: &[u8]) -> Result<(), TetherError> {
        if self.is_closed() {
            return Err(TetherError::ConnectionClosed);
        }
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(TetherError::ConnectionClosed)?;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(TetherError::ConnectionClosed),
            written = writer.write_all(frame) => {
                written?;
                trace!(connection = self.id(), bytes = frame.len(), "frame written");
                Ok(())
            }
        }
    }

    /// Close the socket and release every task and component.
    ///
    /// Idempotent; returns `true` only for the call that actually closed.
    /// Shutdown errors are ignored.
    pub async fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.cancel.cancel();
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.inner.systems.release();
        debug!(connection = self.id(), peer = %self.peer_addr(), "connection closed");
        true
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── ConnectionReader ─────────────────────────────────────────────

/// Read half of a connection; owned by exactly one receive loop.
pub struct ConnectionReader {
    id: u64,
    reader: OwnedReadHalf,
    codec: FrameCodec,
    buffer: BytesMut,
    pool: BufferPool,
    cancel: CancellationToken,
}

impl ConnectionReader {
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    /// Next complete frame payload.
    ///
    /// `Ok(None)` on a clean EOF or after the connection was closed. A
    /// peer that hangs up mid-frame yields `ConnectionClosed`; corrupt
    /// framing yields the codec error and the stream must be dropped.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, TetherError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let mut chunk = self.pool.rent();
            chunk.reserve(self.pool.buffer_size());
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                read = self.reader.read_buf(&mut *chunk) => read?,
            };
            if read == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(TetherError::ConnectionClosed)
                };
            }
            self.buffer.extend_from_slice(&chunk);
        }
    }
}

impl fmt::Debug for ConnectionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionReader")
            .field("id", &self.id)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
