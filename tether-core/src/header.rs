use crate::error::TetherError;

/// Magic prefix of every frame on the wire.
pub const FRAME_MAGIC: [u8; 4] = *b"TTH1";

/// Encoded size of a [`FrameHeader`].
pub const HEADER_SIZE: usize = 12;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

/// Fixed-size prefix that delimits one packed packet on a stream.
///
/// ```text
/// magic:    [u8; 4]  "TTH1"
/// checksum: u32      first 4 bytes of blake3(payload), LE
/// length:   u32      payload length in bytes, LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    checksum: u32,
    length: u32,
}

impl FrameHeader {
    /// Build the header for `payload`, computing its checksum.
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: payload_checksum(payload),
            length: payload.len() as u32,
        }
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut header: FrameHeaderBytes = [0; HEADER_SIZE];
        header[0..4].copy_from_slice(&FRAME_MAGIC);
        header[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        header[8..12].copy_from_slice(&self.length.to_le_bytes());
        header
    }

    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, TetherError> {
        if bytes[0..4] != FRAME_MAGIC {
            return Err(TetherError::InvalidMagic);
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[4..8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[8..12]);
        Ok(Self {
            checksum: u32::from_le_bytes(checksum),
            length: u32::from_le_bytes(length),
        })
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn payload_length(&self) -> usize {
        self.length as usize
    }

    /// Whether `payload` matches the checksum recorded in this header.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload_checksum(payload) == self.checksum
    }
}

/// Truncated blake3 digest used as the frame checksum.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&hash.as_bytes()[0..4]);
    u32::from_le_bytes(prefix)
}
