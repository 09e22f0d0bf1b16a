//! Packet sub-protocol discriminators and well-known map keys.

use std::fmt;

// ── Keys ─────────────────────────────────────────────────────────

/// Reserved header keys.
pub mod header_keys {
    /// Sub-protocol discriminator.
    pub const TYPE: &str = "Type";
    /// Correlates a request with its reply.
    pub const REQUEST_ID: &str = "RequestID";
}

/// Well-known body keys.
pub mod body_keys {
    /// Command name in a `command` packet.
    pub const COMMAND: &str = "command";
    /// Positional command arguments (JSON array).
    pub const ARGS: &str = "args";
    /// Human-readable status in a `CommandResponse`.
    pub const MESSAGE: &str = "Message";
    /// Command return value in a `CommandResponse`.
    pub const COMMAND_RESPONSE: &str = "CommandResponse";
    /// Heartbeat reply text.
    pub const HEARTBEAT_MESSAGE: &str = "message";
}

/// Body text of a heartbeat reply.
pub const PONG: &str = "pong";

// ── PacketType ───────────────────────────────────────────────────

/// The value of the `Type` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Remote command invocation.
    Command,
    /// Liveness probe.
    Heartbeat,
    /// Reply to a `Command`.
    CommandResponse,
    /// Application-defined sub-protocol.
    Custom(String),
}

impl PacketType {
    pub fn as_str(&self) -> &str {
        match self {
            PacketType::Command => "command",
            PacketType::Heartbeat => "heartbeat",
            PacketType::CommandResponse => "CommandResponse",
            PacketType::Custom(name) => name,
        }
    }
}

impl From<&str> for PacketType {
    fn from(value: &str) -> Self {
        match value {
            "command" => PacketType::Command,
            "heartbeat" => PacketType::Heartbeat,
            "CommandResponse" => PacketType::CommandResponse,
            other => PacketType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_types_parse() {
        assert_eq!(PacketType::from("command"), PacketType::Command);
        assert_eq!(PacketType::from("heartbeat"), PacketType::Heartbeat);
        assert_eq!(
            PacketType::from("CommandResponse"),
            PacketType::CommandResponse
        );
    }

    #[test]
    fn custom_type_keeps_name() {
        let t = PacketType::from("chat");
        assert_eq!(t, PacketType::Custom("chat".into()));
        assert_eq!(t.to_string(), "chat");
    }
}
