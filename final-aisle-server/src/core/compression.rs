//! Bounded LZ4 compression for frame payloads.

/// Default upper bound for a decompressed payload (matches the default frame limit).
pub const DEFAULT_MAX_DECOMPRESSED: usize = 1024 * 1024;

/// Compression errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    /// Input is too short to hold the size header.
    #[error("compressed data truncated")]
    Truncated,

    /// Claimed output size exceeds the allowed bound.
    #[error("decompressed size {claimed} exceeds limit {limit}")]
    TooLarge {
        /// Size announced in the header.
        claimed: usize,
        /// Configured limit.
        limit: usize,
    },

    /// LZ4 block is corrupt.
    #[error("decompression failed")]
    Corrupt,
}

/// Compress `data`, prepending the uncompressed size.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress data produced by [`compress`].
///
/// The size header is checked against `limit` before anything is allocated.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
    if data.len() < 4 {
        return Err(CompressionError::Truncated);
    }

    let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if claimed > limit {
        return Err(CompressionError::TooLarge { claimed, limit });
    }

    lz4_flex::decompress_size_prepended(data).map_err(|_| CompressionError::Corrupt)
}
