//! The tether packet: a header map and a body map, sealed for the wire.
//!
//! # Sealed format
//!
//! ```text
//! bincode(SealedPacket {
//!     version: u8,            // ENVELOPE_VERSION
//!     flags:   u8,            // ProtocolFlags
//!     nonce:   [u8; 12],      // zero unless ENCRYPTED
//!     data:    Vec<u8>,       // json → zstd? → aes-256-gcm?
//! })
//! ```
//!
//! The sealed bytes are self-describing, so the same output travels inside
//! a stream frame (see [`crate::codec`]) or base64-encoded over HTTP.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bincode::Options;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TetherError;
use crate::flags::ProtocolFlags;
use crate::message::{PONG, PacketType, body_keys, header_keys};

/// Largest sealed packet accepted by [`Packet::unpack`].
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// JSON bodies above this size are zstd-compressed before sealing.
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const ZSTD_LEVEL: i32 = 3;
const KEY_CONTEXT: &str = "tether 2024-06 packet sealing key";

#[derive(Serialize, Deserialize)]
struct SealedPacket {
    version: u8,
    flags: u8,
    nonce: [u8; NONCE_SIZE],
    data: Vec<u8>,
}

fn envelope_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PAYLOAD_SIZE as u64 + 64)
}

fn cipher_for(key: &str) -> Result<Aes256Gcm, TetherError> {
    let derived = blake3::derive_key(KEY_CONTEXT, key.as_bytes());
    Aes256Gcm::new_from_slice(&derived).map_err(|e| TetherError::Encoding(format!("cipher: {e}")))
}

// ── Packet ───────────────────────────────────────────────────────

/// A header map and a body map exchanged between peers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    body: Map<String, Value>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty packet with the `Type` header set.
    pub fn of_type(packet_type: PacketType) -> Self {
        Self::new().with_type(packet_type)
    }

    /// A liveness probe.
    pub fn heartbeat() -> Self {
        Self::of_type(PacketType::Heartbeat)
    }

    /// The reply body to a heartbeat.
    pub fn pong() -> Self {
        Self::heartbeat().with_body(body_keys::HEARTBEAT_MESSAGE, PONG)
    }

    /// A remote command invocation.
    pub fn command(name: &str, args: Vec<Value>) -> Self {
        Self::of_type(PacketType::Command)
            .with_body(body_keys::COMMAND, name)
            .with_body(body_keys::ARGS, Value::Array(args))
    }

    /// The reply to a command invocation.
    pub fn command_response(message: &str, result: Value) -> Self {
        Self::of_type(PacketType::CommandResponse)
            .with_body(body_keys::MESSAGE, message)
            .with_body(body_keys::COMMAND_RESPONSE, result)
    }

    // ── Builders ─────────────────────────────────────────────────

    pub fn with_type(self, packet_type: PacketType) -> Self {
        self.with_header(header_keys::TYPE, packet_type.as_str())
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_header(key, value);
        self
    }

    pub fn with_body(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_body(key, value);
        self
    }

    /// Copy the `RequestID` of `request` so the peer can correlate this reply.
    pub fn reply_to(mut self, request: &Packet) -> Self {
        match request.request_id() {
            Some(id) => {
                let id = id.to_string();
                self.set_request_id(&id);
            }
            None => {
                self.headers.remove(header_keys::REQUEST_ID);
            }
        }
        self
    }

    pub fn set_header(&mut self, key: &str, value: impl Into<Value>) {
        self.headers.insert(key.to_string(), value.into());
    }

    pub fn set_body(&mut self, key: &str, value: impl Into<Value>) {
        self.body.insert(key.to_string(), value.into());
    }

    pub fn set_request_id(&mut self, id: &str) {
        self.set_header(header_keys::REQUEST_ID, id);
    }

    /// Attach a fresh random `RequestID` and return it.
    pub fn assign_request_id(&mut self) -> String {
        let id = Uuid::new_v4().to_string();
        self.set_request_id(&id);
        id
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn body_value(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// String value of a body key, if present and a string.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.headers
            .get(header_keys::TYPE)
            .and_then(Value::as_str)
            .map(PacketType::from)
    }

    pub fn is_type(&self, packet_type: &PacketType) -> bool {
        self.packet_type().as_ref() == Some(packet_type)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(header_keys::REQUEST_ID)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    // ── Sealing ──────────────────────────────────────────────────

    /// Serialize headers and body; encrypt when `key` is non-empty.
    pub fn pack(&self, key: &str) -> Result<Bytes, TetherError> {
        let json = serde_json::to_vec(self).map_err(|e| TetherError::Encoding(e.to_string()))?;

        let mut flags = ProtocolFlags::empty();
        let mut data = if json.len() > COMPRESSION_THRESHOLD {
            flags |= ProtocolFlags::COMPRESSED;
            zstd::bulk::compress(&json, ZSTD_LEVEL)
                .map_err(|e| TetherError::Encoding(format!("zstd: {e}")))?
        } else {
            json
        };

        let mut nonce = [0u8; NONCE_SIZE];
        if !key.is_empty() {
            rand::rng().fill_bytes(&mut nonce);
            data = cipher_for(key)?
                .encrypt(Nonce::from_slice(&nonce), data.as_ref())
                .map_err(|e| TetherError::Encoding(format!("encrypt: {e}")))?;
            flags |= ProtocolFlags::ENCRYPTED;
        }

        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(TetherError::FrameTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let sealed = SealedPacket {
            version: ENVELOPE_VERSION,
            flags: flags.bits(),
            nonce,
            data,
        };
        let bytes = envelope_options()
            .serialize(&sealed)
            .map_err(|e| TetherError::Encoding(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    /// Inverse of [`Packet::pack`].
    ///
    /// Any envelope, decryption, decompression or JSON failure is a
    /// [`TetherError::Protocol`]; a wrong key never yields a packet.
    pub fn unpack(bytes: &[u8], key: &str) -> Result<Self, TetherError> {
        let sealed: SealedPacket = envelope_options().deserialize(bytes)?;
        if sealed.version != ENVELOPE_VERSION {
            return Err(TetherError::Protocol(format!(
                "unsupported envelope version {}",
                sealed.version
            )));
        }
        let flags = ProtocolFlags::from_bits(sealed.flags)
            .ok_or_else(|| TetherError::Protocol(format!("unknown flags {:#x}", sealed.flags)))?;

        let mut data = sealed.data;
        match (flags.contains(ProtocolFlags::ENCRYPTED), key.is_empty()) {
            (true, true) => {
                return Err(TetherError::Protocol(
                    "packet is encrypted but no key was supplied".into(),
                ));
            }
            (false, false) => {
                return Err(TetherError::Protocol(
                    "packet is not encrypted but a key was supplied".into(),
                ));
            }
            (true, false) => {
                data = cipher_for(key)?
                    .decrypt(Nonce::from_slice(&sealed.nonce), data.as_ref())
                    .map_err(|_| TetherError::Protocol("decryption failed".into()))?;
            }
            (false, true) => {}
        }

        if flags.contains(ProtocolFlags::COMPRESSED) {
            data = zstd::bulk::decompress(&data, MAX_PAYLOAD_SIZE)
                .map_err(|e| TetherError::Protocol(format!("zstd: {e}")))?;
        }

        Ok(serde_json::from_slice(&data)?)
    }

    /// Unpack a packet carried as base64 text (optionally JSON-quoted).
    pub fn unpack_base64(text: &str, key: &str) -> Result<Self, TetherError> {
        let trimmed = text.trim().trim_matches('"');
        if trimmed.is_empty() {
            return Err(TetherError::Protocol("empty base64 payload".into()));
        }
        let bytes = BASE64
            .decode(trimmed)
            .map_err(|e| TetherError::Protocol(format!("base64: {e}")))?;
        Self::unpack(&bytes, key)
    }

    /// Base64 text form of [`Packet::pack`], for HTTP transports.
    pub fn pack_base64(&self, key: &str) -> Result<String, TetherError> {
        Ok(BASE64.encode(self.pack(key)?))
    }
}
