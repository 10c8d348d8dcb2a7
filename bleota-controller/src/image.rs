//! Firmware image held for the length of one session

use std::sync::Arc;

use crate::error::SessionError;

/// Firmware bytes delivered to the device, shared read-only with the engine
#[derive(Clone)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
}

impl FirmwareImage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, SessionError> {
        let bytes: Vec<u8> = bytes.into();
        if bytes.is_empty() {
            return Err(SessionError::EmptyImage);
        }
        Ok(Self {
            bytes: bytes.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false, empty images are rejected on construction
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Slice of at most `max_len` bytes starting at `offset`
    pub fn chunk(&self, offset: usize, max_len: usize) -> &[u8] {
        let start = offset.min(self.bytes.len());
        let end = start.saturating_add(max_len).min(self.bytes.len());
        &self.bytes[start..end]
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}
