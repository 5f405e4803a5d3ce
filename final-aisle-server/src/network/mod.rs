//! Network Layer
//!
//! TCP relay server, transport handshake, registration/login and the
//! movement relay.

pub mod auth;
pub mod client;
pub mod dispatcher;
pub mod handshake;
pub mod mail;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

pub use auth::{AuthConfig, AuthService, PendingRegistration, RegistrationRejection};
pub use client::{ClientError, RelayClient};
pub use dispatcher::Dispatcher;
pub use handshake::{ClientHandshake, HandshakeError, HandshakeState, ServerHandshake};
pub use mail::{Email, LogMailer, MailError, Mailer, MemoryMailer, SmtpConfig, SmtpMailer};
pub use protocol::{
    CharacterSummary, ClientRequest, MessageKey, Password, ProtocolError, RelayEvent, ServerMessage,
};
pub use relay::{AcceptAll, FiniteMovement, MovementValidator, Relay};
pub use server::{RelayServer, ServerConfig, ServerError, TrafficSnapshot, TrafficStats, DEFAULT_PORT};
pub use session::{Session, SessionHandle, SessionId, SessionManager};

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Parse environment variable `name`, falling back to `default` when it is
/// unset or invalid.
pub(crate) fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid {}={:?} ({}), using default", name, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}
