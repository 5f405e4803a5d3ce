//! Key Material
//!
//! - [`SymmetricKey`]: per-session XChaCha20-Poly1305 key. Every seal call
//!   draws a fresh random nonce and prepends it to the ciphertext.
//! - [`HandshakeKeyPair`]: one-time RSA keypair a peer generates at
//!   connection start. The server wraps its symmetric key under the peer's
//!   public key with OAEP(SHA-256) via [`wrap_key`].

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (XChaCha20).
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Default RSA modulus size for handshake keypairs.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Largest peer public key accepted, in bytes of modulus (4096 bits).
pub const MAX_PUBLIC_KEY_BYTES: usize = 512;

/// Cryptographic errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Key material has the wrong size.
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Sealed data is shorter than nonce plus tag.
    #[error("ciphertext truncated")]
    Truncated,

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD authentication or decryption failed.
    #[error("decryption failed")]
    DecryptionFailed,

    /// RSA keypair could not be generated.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Peer public key is not valid SPKI DER.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Peer public key modulus is larger than allowed.
    #[error("public key too large: {0} bytes")]
    PublicKeyTooLarge(usize),

    /// Wrapping the symmetric key failed.
    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    /// Unwrapping the symmetric key failed.
    #[error("key unwrap failed")]
    KeyUnwrap,
}

// =============================================================================
// SYMMETRIC
// =============================================================================

/// Session or storage key for authenticated encryption.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Generate a random key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Build a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short non-secret identifier for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }

    /// Encrypt `plaintext`, returning `[nonce][ciphertext+tag]`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt data produced by [`SymmetricKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", self.fingerprint())
    }
}

// =============================================================================
// ASYMMETRIC
// =============================================================================

/// One-time RSA keypair used to receive the session key.
pub struct HandshakeKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl HandshakeKeyPair {
    /// Generate a fresh keypair with a `bits`-bit modulus.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Public key as SPKI DER.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.public
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Recover a symmetric key wrapped by [`wrap_key`].
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<SymmetricKey, CryptoError> {
        let mut raw = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| CryptoError::KeyUnwrap)?;
        let key = SymmetricKey::from_bytes(&raw);
        raw.zeroize();
        key
    }
}

impl fmt::Debug for HandshakeKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeKeyPair")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Encrypt `key` under a peer's SPKI DER public key.
pub fn wrap_key(public_der: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let public = RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    if public.size() > MAX_PUBLIC_KEY_BYTES {
        return Err(CryptoError::PublicKeyTooLarge(public.size()));
    }

    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = SymmetricKey::generate();
        let sealed = key.seal(b"LoginSuccess").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 12 + TAG_LEN);
        assert_eq!(key.open(&sealed).unwrap(), b"LoginSuccess");
    }

    #[test]
    fn test_fresh_nonce_each_seal() {
        let key = SymmetricKey::generate();
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SymmetricKey::generate().seal(b"secret").unwrap();
        let other = SymmetricKey::generate();
        assert_eq!(other.open(&sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::generate();
        let mut sealed = key.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(key.open(&sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let key = SymmetricKey::generate();
        assert_eq!(key.open(&[0u8; NONCE_LEN]), Err(CryptoError::Truncated));
    }

    #[test]
    fn test_key_from_bytes_length() {
        assert!(SymmetricKey::from_bytes(&[1u8; KEY_LEN]).is_ok());
        assert_eq!(
            SymmetricKey::from_bytes(&[1u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SymmetricKey::from_bytes(&[0xAB; KEY_LEN]).unwrap();
        let shown = format!("{key:?}");
        assert!(!shown.contains("abab"));
        assert!(shown.starts_with("SymmetricKey("));
    }

    #[test]
    fn test_wrap_unwrap() {
        let pair = HandshakeKeyPair::generate(1024).unwrap();
        let der = pair.public_key_der().unwrap();
        let key = SymmetricKey::generate();

        let wrapped = wrap_key(&der, &key).unwrap();
        assert_eq!(pair.unwrap_key(&wrapped).unwrap(), key);
    }

    #[test]
    fn test_wrap_rejects_garbage_public_key() {
        let key = SymmetricKey::generate();
        assert!(matches!(
            wrap_key(b"not a key", &key),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_unwrap_with_other_pair_fails() {
        let pair = HandshakeKeyPair::generate(1024).unwrap();
        let other = HandshakeKeyPair::generate(1024).unwrap();
        let wrapped = wrap_key(&pair.public_key_der().unwrap(), &SymmetricKey::generate()).unwrap();
        assert_eq!(other.unwrap_key(&wrapped), Err(CryptoError::KeyUnwrap));
    }
}
