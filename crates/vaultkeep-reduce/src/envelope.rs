//! On-disk framing for stored blocks.
//!
//! ```text
//! magic "VKBL" | version u8 | compression u8 | flags u8 | original_len u64 LE | body
//! ```
//! `flags` bit 0 marks an encrypted body, in which case the body is an
//! [`EncryptedBlob`](crate::encryption::EncryptedBlob) wrapping the compressed bytes.

use crate::compression::CompressionAlgorithm;
use crate::error::ReduceError;

const MAGIC: [u8; 4] = *b"VKBL";
const VERSION: u8 = 1;
const FLAG_ENCRYPTED: u8 = 0x01;
/// Bytes of framing before the body
pub const ENVELOPE_HEADER_LEN: usize = 4 + 1 + 1 + 1 + 8;

/// A decoded block envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEnvelope {
    /// Algorithm the body (or the plaintext inside the blob) was compressed with
    pub compression: CompressionAlgorithm,
    /// Body is an encrypted blob
    pub encrypted: bool,
    /// Block length before compression
    pub original_len: u64,
    /// Payload
    pub body: Vec<u8>,
}

impl BlockEnvelope {
    /// Serialize header and body
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.body.len());
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(self.compression.code());
        out.push(if self.encrypted { FLAG_ENCRYPTED } else { 0 });
        out.extend_from_slice(&self.original_len.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse bytes produced by [`BlockEnvelope::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self, ReduceError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(ReduceError::InvalidEnvelope(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(ReduceError::InvalidEnvelope("bad magic".to_string()));
        }
        if bytes[4] != VERSION {
            return Err(ReduceError::InvalidEnvelope(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }
        let compression = CompressionAlgorithm::from_code(bytes[5]).ok_or_else(|| {
            ReduceError::InvalidEnvelope(format!("unknown compression code {}", bytes[5]))
        })?;
        let flags = bytes[6];
        if flags & !FLAG_ENCRYPTED != 0 {
            return Err(ReduceError::InvalidEnvelope(format!(
                "unknown flags {:#04x}",
                flags
            )));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[7..ENVELOPE_HEADER_LEN]);
        Ok(Self {
            compression,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            original_len: u64::from_le_bytes(len),
            body: bytes[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }
}
