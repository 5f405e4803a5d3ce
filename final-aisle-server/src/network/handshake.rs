//! Transport Handshake
//!
//! ```text
//! client                                   server
//!   | -- lz4(SPKI public key) ------------->  |  KeyNotSent -> KeySent
//!   | <------------- lz4(RSA-OAEP(sym key)) -- |
//!   | -- seal(SecureConnectionEstablished) ->  |  secure = true
//! ```
//!
//! The two handshake frames use normal framing with no symmetric layer.
//! Which interpretation a frame gets is decided by [`HandshakeState`], never
//! by a header tag.

use std::fmt;

use crate::core::compression::{self, CompressionError};
use crate::core::crypto::{wrap_key, CryptoError, HandshakeKeyPair, SymmetricKey};
use crate::core::packet::Packet;
use crate::network::protocol::MessageKey;

/// Handshake errors. Fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// A handshake frame arrived after the key was exchanged.
    #[error("unexpected handshake frame in state {0}")]
    UnexpectedFrame(HandshakeState),

    /// Key material failed to decompress.
    #[error("handshake compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Key material was rejected.
    #[error("handshake crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Server-side key delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Next inbound frame is the peer's public key.
    KeyNotSent,
    /// Wrapped key delivered, inbound frames are sealed packets.
    KeySent,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// SERVER ROLE
// =============================================================================

/// Server half of the handshake. Owns the session key from creation.
#[derive(Debug)]
pub struct ServerHandshake {
    key: SymmetricKey,
    state: HandshakeState,
    secure: bool,
}

impl ServerHandshake {
    /// Start with a freshly generated session key.
    pub fn new() -> Self {
        Self::with_key(SymmetricKey::generate())
    }

    /// Start with a given session key.
    pub fn with_key(key: SymmetricKey) -> Self {
        Self {
            key,
            state: HandshakeState::KeyNotSent,
            secure: false,
        }
    }

    /// Session key.
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Delivery state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// True once the peer has confirmed the key.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Treat `body` as the peer's compressed public key and build the reply
    /// frame body carrying the wrapped session key.
    pub fn accept_public_key(&mut self, body: &[u8], limit: usize) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::KeyNotSent {
            return Err(HandshakeError::UnexpectedFrame(self.state));
        }

        let public_der = compression::decompress(body, limit)?;
        let wrapped = wrap_key(&public_der, &self.key)?;
        self.state = HandshakeState::KeySent;
        Ok(compression::compress(&wrapped))
    }

    /// Mark the channel secure if `packet` is the confirmation sentinel.
    ///
    /// Returns true only on the transition.
    pub fn confirm(&mut self, packet: &Packet) -> bool {
        if self.secure
            || self.state != HandshakeState::KeySent
            || packet.key() != MessageKey::SecureConnectionEstablished.as_str()
        {
            return false;
        }
        self.secure = true;
        true
    }
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CLIENT ROLE
// =============================================================================

/// Client half of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    keypair: HandshakeKeyPair,
    key: Option<SymmetricKey>,
}

impl ClientHandshake {
    /// Generate the one-time keypair.
    pub fn new(bits: usize) -> Result<Self, HandshakeError> {
        Ok(Self {
            keypair: HandshakeKeyPair::generate(bits)?,
            key: None,
        })
    }

    /// First frame body: the compressed public key.
    pub fn hello(&self) -> Result<Vec<u8>, HandshakeError> {
        Ok(compression::compress(&self.keypair.public_key_der()?))
    }

    /// Adopt the wrapped key from the server's reply and return the sentinel
    /// packet to send under it.
    pub fn accept_wrapped_key(&mut self, body: &[u8], limit: usize) -> Result<Packet, HandshakeError> {
        if self.key.is_some() {
            return Err(HandshakeError::UnexpectedFrame(HandshakeState::KeySent));
        }

        let wrapped = compression::decompress(body, limit)?;
        self.key = Some(self.keypair.unwrap_key(&wrapped)?);
        Ok(Packet::empty(MessageKey::SecureConnectionEstablished))
    }

    /// Shared key, once adopted.
    pub fn key(&self) -> Option<&SymmetricKey> {
        self.key.as_ref()
    }

    /// True once the shared key is known.
    pub fn is_established(&self) -> bool {
        self.key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{open_packet, seal_packet, DEFAULT_MAX_FRAME_SIZE};

    const LIMIT: usize = DEFAULT_MAX_FRAME_SIZE;

    #[test]
    fn test_full_exchange() {
        let mut server = ServerHandshake::new();
        let mut client = ClientHandshake::new(1024).unwrap();
        assert_eq!(server.state(), HandshakeState::KeyNotSent);

        let reply = server.accept_public_key(&client.hello().unwrap(), LIMIT).unwrap();
        assert_eq!(server.state(), HandshakeState::KeySent);
        assert!(!server.is_secure());

        let sentinel = client.accept_wrapped_key(&reply, LIMIT).unwrap();
        assert_eq!(client.key(), Some(server.key()));

        let sealed = seal_packet(&sentinel, client.key().unwrap()).unwrap();
        let received = open_packet(&sealed, server.key(), LIMIT).unwrap();
        assert!(server.confirm(&received));
        assert!(server.is_secure());
        assert!(client.is_established());

        assert!(!server.confirm(&received));
    }

    #[test]
    fn test_confirm_requires_sentinel() {
        let mut server = ServerHandshake::new();
        let client = ClientHandshake::new(1024).unwrap();
        server.accept_public_key(&client.hello().unwrap(), LIMIT).unwrap();

        assert!(!server.confirm(&Packet::empty("TryLogin")));
        assert!(!server.is_secure());
    }

    #[test]
    fn test_confirm_before_key_sent() {
        let mut server = ServerHandshake::new();
        assert!(!server.confirm(&Packet::empty("SecureConnectionEstablished")));
    }

    #[test]
    fn test_second_public_key_rejected() {
        let mut server = ServerHandshake::new();
        let client = ClientHandshake::new(1024).unwrap();
        let hello = client.hello().unwrap();

        server.accept_public_key(&hello, LIMIT).unwrap();
        assert!(matches!(
            server.accept_public_key(&hello, LIMIT),
            Err(HandshakeError::UnexpectedFrame(HandshakeState::KeySent))
        ));
    }

    #[test]
    fn test_garbage_public_key() {
        let mut server = ServerHandshake::new();
        let garbage = compression::compress(b"definitely not DER");
        assert!(matches!(
            server.accept_public_key(&garbage, LIMIT),
            Err(HandshakeError::Crypto(CryptoError::InvalidPublicKey(_)))
        ));
        assert_eq!(server.state(), HandshakeState::KeyNotSent);

        assert!(matches!(
            server.accept_public_key(b"\x01", LIMIT),
            Err(HandshakeError::Compression(_))
        ));
    }
}
