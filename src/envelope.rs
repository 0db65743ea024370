//! Integrity framing for persisted payloads.
//!
//! Every payload that reaches the metadata store or the blob store is
//! sealed into an LZ4-compressed, xxHash3-checksummed frame. Opening a
//! frame validates sizes, enforces a decompression-ratio ceiling, and
//! verifies the checksum, so any byte-level corruption of stored data
//! surfaces as an [`EnvelopeError`] instead of a silently wrong value.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("payload exceeds maximum size")]
    PayloadTooLarge,

    #[error("decompression ratio exceeds safety limit")]
    DecompressionBomb,

    #[error("integrity check failed")]
    ChecksumMismatch,

    #[error("decompression failed")]
    DecompressionFailed,

    #[error("size validation failed")]
    SizeMismatch,

    #[error("envelope framing failed: {0}")]
    Frame(String),
}

// Safety limits on stored payloads.
const MAX_PAYLOAD_SIZE: usize = 512 * 1024 * 1024;
const MAX_SEALED_SIZE: usize = 512 * 1024 * 1024;
/// Maximum allowed decompression ratio (1000:1), enforced with integer
/// arithmetic so no float-precision edge can sneak past it.
const MAX_DECOMPRESSION_RATIO: u64 = 1000;

/// Identifier for the inner payload encoding.
pub const FORMAT_MSGPACK: &str = "msgpack";

/// On-disk frame around a serialized result.
#[derive(Serialize, Deserialize)]
struct PayloadEnvelope {
    compressed: Vec<u8>,
    /// xxHash3-64 of the original payload, big-endian.
    checksum: [u8; 8],
    original_size: u32,
    format: String,
}

/// Compress, checksum, and frame a payload for storage.
pub fn seal(payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(EnvelopeError::PayloadTooLarge);
    }

    let envelope = PayloadEnvelope {
        compressed: lz4_flex::compress(payload),
        checksum: xxh3_64(payload).to_be_bytes(),
        original_size: payload.len() as u32,
        format: FORMAT_MSGPACK.to_string(),
    };

    let sealed =
        rmp_serde::to_vec(&envelope).map_err(|e| EnvelopeError::Frame(e.to_string()))?;
    if sealed.len() > MAX_SEALED_SIZE {
        return Err(EnvelopeError::PayloadTooLarge);
    }
    Ok(sealed)
}

/// Unframe, validate, and decompress a stored payload.
pub fn open(sealed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if sealed.len() > MAX_SEALED_SIZE {
        return Err(EnvelopeError::PayloadTooLarge);
    }

    let envelope: PayloadEnvelope =
        rmp_serde::from_slice(sealed).map_err(|e| EnvelopeError::Frame(e.to_string()))?;

    if envelope.compressed.len() > MAX_SEALED_SIZE {
        return Err(EnvelopeError::PayloadTooLarge);
    }
    if envelope.original_size as usize > MAX_PAYLOAD_SIZE {
        return Err(EnvelopeError::PayloadTooLarge);
    }

    // Decompression-bomb guard. Empty compressed data claiming a non-zero
    // original is a bomb; so is any claimed expansion past the ratio
    // ceiling. checked_mul treats overflow as a bomb (fail-safe).
    let compressed_size = envelope.compressed.len() as u64;
    if compressed_size == 0 && envelope.original_size != 0 {
        return Err(EnvelopeError::DecompressionBomb);
    }
    if compressed_size > 0 {
        let max_allowed = MAX_DECOMPRESSION_RATIO
            .checked_mul(compressed_size)
            .ok_or(EnvelopeError::DecompressionBomb)?;
        if u64::from(envelope.original_size) > max_allowed {
            return Err(EnvelopeError::DecompressionBomb);
        }
    }

    let payload = lz4_flex::decompress(&envelope.compressed, envelope.original_size as usize)
        .map_err(|_| EnvelopeError::DecompressionFailed)?;

    if xxh3_64(&payload).to_be_bytes() != envelope.checksum {
        return Err(EnvelopeError::ChecksumMismatch);
    }
    if payload.len() != envelope.original_size as usize {
        return Err(EnvelopeError::SizeMismatch);
    }

    Ok(payload)
}
