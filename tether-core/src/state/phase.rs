//! Lifecycle state machines for servers and clients.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::net::SocketAddr;

use crate::error::TetherError;

// ── ServerPhase ──────────────────────────────────────────────────

/// ```text
///  Created ──► Bound ──► Listening ──► Stopped
///     ▲          │
///     └──────────┘  (bind/listen failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerPhase {
    #[default]
    Created,
    /// Socket bound, not yet accepting.
    Bound { addr: SocketAddr },
    Listening { addr: SocketAddr },
    Stopped,
}

impl std::fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Bound { .. } => write!(f, "Bound"),
            Self::Listening { .. } => write!(f, "Listening"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ServerPhase {
    pub fn is_listening(&self) -> bool {
        matches!(self, Self::Listening { .. })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Bound { addr } | Self::Listening { addr } => Some(*addr),
            _ => None,
        }
    }

    /// Valid from: `Created`.
    pub fn bind(&mut self, addr: SocketAddr) -> Result<(), TetherError> {
        match self {
            Self::Created => {
                *self = Self::Bound { addr };
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot bind: server is not in Created state")),
        }
    }

    /// Valid from: `Bound`.
    pub fn listen(&mut self) -> Result<(), TetherError> {
        match *self {
            Self::Bound { addr } => {
                *self = Self::Listening { addr };
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot listen: server is not bound")),
        }
    }

    /// Roll back a failed start. Valid from: `Created`, `Bound`.
    pub fn reset(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Created | Self::Bound { .. } => {
                *self = Self::Created;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot reset: server already started")),
        }
    }

    /// Valid from: `Listening`.
    pub fn stop(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Listening { .. } => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot stop: server is not listening")),
        }
    }
}

// ── ClientPhase ──────────────────────────────────────────────────

/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲               │              │
///       └───────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientPhase {
    #[default]
    Disconnected,
    Connecting,
    /// Carries the id of the live connection.
    Connected { connection_id: u64 },
}

impl std::fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
        }
    }
}

impl ClientPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot connect: client is not disconnected")),
        }
    }

    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self, connection_id: u64) -> Result<(), TetherError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected { connection_id };
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot complete connect: client is not connecting")),
        }
    }

    /// Back to `Disconnected` after a failed connect. Valid from: `Connecting`.
    pub fn fail_connect(&mut self) -> Result<(), TetherError> {
        match self {
            Self::Connecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(TetherError::InvalidState("cannot fail connect: client is not connecting")),
        }
    }

    /// Leave `Connected` for the given connection.
    ///
    /// Returns `false` when the client is not connected through
    /// `connection_id`, so each connection lifetime disconnects once.
    pub fn disconnect(&mut self, connection_id: u64) -> bool {
        match *self {
            Self::Connected { connection_id: live } if live == connection_id => {
                *self = Self::Disconnected;
                true
            }
            _ => false,
        }
    }
}
