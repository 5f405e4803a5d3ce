//! Wire primitives.
//!
//! Packet model, compression, key material and framing. Nothing here
//! touches sockets or shared state.

pub mod codec;
pub mod compression;
pub mod crypto;
pub mod packet;

pub use codec::{decode_packet, encode_packet, Decoded, FrameCodec, FrameError};
pub use crypto::{CryptoError, HandshakeKeyPair, SymmetricKey};
pub use packet::{Composite, Packet, PacketError, PacketKind, Payload};
