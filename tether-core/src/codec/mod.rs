//! Stream framing for sealed packets.
//!
//! Each frame is a [`FrameHeader`] followed by exactly `length` payload
//! bytes. Any framing error is fatal for the connection that produced it.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TetherError;
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};
use crate::packet::MAX_PAYLOAD_SIZE;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = MAX_PAYLOAD_SIZE;

/// Splits a byte stream into checksummed payload frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    pending: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw: FrameHeaderBytes = [0; HEADER_SIZE];
                raw.copy_from_slice(&src[..HEADER_SIZE]);
                let header = FrameHeader::from_bytes(&raw)?;
                if header.payload_length() > MAX_FRAME_PAYLOAD {
                    return Err(TetherError::FrameTooLarge {
                        size: header.payload_length(),
                        max: MAX_FRAME_PAYLOAD,
                    });
                }
                let _ = src.split_to(HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let length = header.payload_length();
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(length).freeze();
        if !header.verify(&payload) {
            return Err(TetherError::ChecksumMismatch);
        }
        Ok(Some(payload))
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_PAYLOAD {
            return Err(TetherError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }
        dst.reserve(HEADER_SIZE + item.len());
        dst.put_slice(&FrameHeader::for_payload(item).to_bytes());
        dst.put_slice(item);
        Ok(())
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&[u8]>::encode(self, item.as_ref(), dst)
    }
}
