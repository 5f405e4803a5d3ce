//! Frame Codec
//!
//! Wire unit:
//!
//! ```text
//! [u32 LE length][body]
//! body (app packet) = [nonce][AEAD(lz4(packet bytes))]
//! body (handshake)  = lz4(key material)
//! ```
//!
//! [`FrameCodec`] only splits the byte stream into bodies; which body
//! interpretation applies is decided by the session's handshake state.
//! [`encode_packet`] / [`decode_packet`] cover the app-packet case end to end.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::compression::{self, CompressionError};
use crate::core::crypto::{CryptoError, SymmetricKey};
use crate::core::packet::{Packet, PacketError};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Default maximum frame body size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame errors. Any of these terminates the owning connection only.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Length prefix announced an empty frame.
    #[error("invalid frame length: {0}")]
    InvalidLength(usize),

    /// Length prefix exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    Oversized {
        /// Announced body length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Body failed to decrypt or authenticate.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Body failed to decompress.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Decrypted body is not a packet.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A packet decoded from the front of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The packet.
    pub packet: Packet,
    /// Bytes consumed from the buffer, prefix included.
    pub consumed: usize,
}

fn check_length(len: usize, max: usize) -> Result<(), FrameError> {
    if len == 0 {
        return Err(FrameError::InvalidLength(len));
    }
    if len > max {
        return Err(FrameError::Oversized { len, max });
    }
    Ok(())
}

/// Body length of the first frame in `buf`, or `None` if the prefix is incomplete.
fn peek_length(buf: &[u8], max: usize) -> Result<Option<usize>, FrameError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let mut prefix = [0u8; LENGTH_PREFIX];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX]);
    let len = u32::from_le_bytes(prefix) as usize;
    check_length(len, max)?;
    Ok(Some(len))
}

// =============================================================================
// STREAM CODEC
// =============================================================================

/// Length-prefixed framing for a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Codec accepting bodies up to `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Configured maximum body size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = peek_length(src, self.max_frame_size)? else {
            return Ok(None);
        };

        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_length(body.len(), self.max_frame_size)?;
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

// =============================================================================
// APP PACKETS
// =============================================================================

/// Serialize, compress and encrypt a packet into a frame body.
pub fn seal_packet(packet: &Packet, key: &SymmetricKey) -> Result<Vec<u8>, FrameError> {
    let raw = packet.to_bytes()?;
    let compressed = compression::compress(&raw);
    Ok(key.seal(&compressed)?)
}

/// Reverse of [`seal_packet`]. `limit` bounds the decompressed size.
pub fn open_packet(body: &[u8], key: &SymmetricKey, limit: usize) -> Result<Packet, FrameError> {
    let compressed = key.open(body)?;
    let raw = compression::decompress(&compressed, limit)?;
    Ok(Packet::from_bytes(&raw)?)
}

/// Prefix a body with its length.
pub fn frame(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
    out.put_u32_le(body.len() as u32);
    out.extend_from_slice(body);
    out.freeze()
}

/// Encode a packet into a complete wire frame.
pub fn encode_packet(packet: &Packet, key: &SymmetricKey) -> Result<Bytes, FrameError> {
    Ok(frame(&seal_packet(packet, key)?))
}

/// Decode the first frame in `buf`.
///
/// Returns `Ok(None)` until the whole frame is present. Callers drain the
/// buffer by advancing `consumed` bytes and calling again.
pub fn decode_packet(
    buf: &[u8],
    key: &SymmetricKey,
    max_frame_size: usize,
) -> Result<Option<Decoded>, FrameError> {
    let Some(len) = peek_length(buf, max_frame_size)? else {
        return Ok(None);
    };

    let consumed = LENGTH_PREFIX + len;
    if buf.len() < consumed {
        return Ok(None);
    }

    let packet = open_packet(&buf[LENGTH_PREFIX..consumed], key, max_frame_size)?;
    Ok(Some(Decoded { packet, consumed }))
}
