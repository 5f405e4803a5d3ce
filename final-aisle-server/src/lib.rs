//! # Final Aisle Server
//!
//! Relay server for Final Aisle: encrypted sessions, email-verified
//! accounts and movement fan-out between logged-in players.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FINAL AISLE SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Wire primitives                           │
//! │  ├── packet.rs   - Typed key/value packets                   │
//! │  ├── compression.rs - Bounded LZ4                            │
//! │  ├── crypto.rs   - XChaCha20-Poly1305 + RSA-OAEP key wrap    │
//! │  └── codec.rs    - Length-prefixed encrypted frames          │
//! │                                                              │
//! │  storage/        - Account persistence                       │
//! │  ├── index.rs    - Case-insensitive sorted index             │
//! │  └── accounts.rs - Encrypted per-account records             │
//! │                                                              │
//! │  network/        - Sessions and routing                      │
//! │  ├── server.rs   - TCP accept loop + connection tasks        │
//! │  ├── handshake.rs- RSA to symmetric key exchange             │
//! │  ├── dispatcher.rs - State-gated request routing             │
//! │  ├── auth.rs     - Registration, verification, login         │
//! │  ├── relay.rs    - Movement fan-out                          │
//! │  ├── session.rs  - Session registry + online directory       │
//! │  ├── protocol.rs - Message vocabulary                        │
//! │  ├── mail.rs     - Verification email delivery               │
//! │  └── client.rs   - Peer-role client                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Lifecycle
//!
//! 1. Client sends its public key, server answers with the wrapped session key.
//! 2. Client confirms with `SecureConnectionEstablished` under that key.
//! 3. Client registers (verified by emailed code) or logs in.
//! 4. Logged-in movement is relayed to every other online player.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use crate::core::codec::{FrameCodec, FrameError};
pub use crate::core::crypto::SymmetricKey;
pub use crate::core::packet::{Composite, Packet, PacketKind, Payload};
pub use network::protocol::{ClientRequest, MessageKey, RelayEvent, ServerMessage};
pub use network::server::{RelayServer, ServerConfig, DEFAULT_PORT};
pub use network::session::SessionId;
pub use storage::accounts::{AccountDirectory, StorageConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
