use bitflags::bitflags;

bitflags! {
    /// Per-packet transformation flags carried in the sealed envelope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolFlags: u8 {
        /// Payload is AES-256-GCM ciphertext.
        const ENCRYPTED = 0b0000_0001;
        /// Payload was zstd-compressed before encryption.
        const COMPRESSED = 0b0000_0010;
    }
}
