//! # tether-core
//!
//! Connection-oriented TCP runtime for custom servers and clients.
//!
//! This crate contains:
//! - **Protocol**: `Packet` (JSON headers and body, optional zstd, optional AES-256-GCM sealing),
//!   `FrameHeader` and `FrameCodec` for framed TCP I/O via `tokio_util`
//! - **Connection**: a TCP peer with its pluggable `Systems`
//!   (components, events, recurring tasks, commands)
//! - **Server**: accept loop, admission, queued packet processing, request correlation,
//!   broadcast, bans and idle checks
//! - **Client**: connect, receive loop, correlated requests, HTTP GET fallback
//! - **Queue**: `QueuePool`, a sharded bounded worker pool
//! - **Error**: `TetherError`, a `thiserror`-based error hierarchy

pub mod ban;
pub mod buffer;
pub mod client;
pub mod codec;
pub mod components;
pub mod config;
pub mod connection;
pub mod error;
pub mod flags;
pub mod header;
pub mod message;
pub mod packet;
pub mod queue;
pub mod server;
pub mod state;
pub mod systems;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use ban::{BanStore, JsonFileBanStore, MemoryBanStore};
pub use buffer::{BufferPool, PooledBuffer};
pub use client::Client;
pub use codec::{FrameCodec, MAX_FRAME_PAYLOAD};
pub use components::{ClientComponent, PermissionGroup, PermissionLevel, Verify};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{Connection, ConnectionInfo, ConnectionReader};
pub use error::{ItemError, TetherError};
pub use flags::ProtocolFlags;
pub use header::{FrameHeader, HEADER_SIZE};
pub use message::PacketType;
pub use packet::{MAX_PAYLOAD_SIZE, Packet};
pub use queue::{
    ItemOutcome, PushOptions, QueueConfig, QueueItemInfo, QueueItemStatus, QueuePool, QueueStatistics,
    QueueTicket, StopReport,
};
pub use server::{AdmissionPolicy, BroadcastReport, Rejection, Server, WeakServer};
pub use state::{ClientPhase, PendingRequests, ServerPhase};
pub use systems::{
    ClientEvent, Command, CommandSystem, Component, ComponentSystem, EventSystem, FnCommand,
    HandlerId, NetworkEvent, ServerEvent, Systems, TaskSystem,
};
