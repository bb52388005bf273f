#![forbid(unsafe_code)]

/// Incremental CRC32 over the fields of a persisted frame.
#[derive(Clone, Default)]
pub struct FrameCrc {
    inner: crc32fast::Hasher,
}

impl FrameCrc {
    /// Empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a big-endian `u16`.
    pub fn u16(mut self, value: u16) -> Self {
        self.inner.update(&value.to_be_bytes());
        self
    }

    /// Adds a big-endian `u64`.
    pub fn u64(mut self, value: u64) -> Self {
        self.inner.update(&value.to_be_bytes());
        self
    }

    /// Adds raw bytes.
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.inner.update(bytes);
        self
    }

    /// Final checksum.
    pub fn finish(self) -> u32 {
        self.inner.finalize()
    }
}

/// CRC over a checkpoint frame: format version, payload length, then payload.
pub fn checkpoint_crc32(version: u16, payload: &[u8]) -> u32 {
    FrameCrc::new()
        .u16(version)
        .u64(payload.len() as u64)
        .bytes(payload)
        .finish()
}
