//! Frame dispatch.
//!
//! A frame body is the peer's public key until the wrapped key has been
//! sent, and a sealed packet afterwards. Packets are then gated on the
//! session state before they reach a handler:
//!
//! | State              | Accepted                                    |
//! |--------------------|---------------------------------------------|
//! | not secure         | `SecureConnectionEstablished`               |
//! | secure, anonymous  | `TryNewAccount`, `TryVerifyEmail`, `TryLogin` |
//! | logged in          | `PlayerPostConnect`, `Logout`, movement     |
//!
//! Anything else is logged and dropped.

use tracing::{debug, info, instrument};

use crate::core::codec::open_packet;
use crate::core::packet::Packet;
use crate::network::auth::AuthService;
use crate::network::handshake::HandshakeState;
use crate::network::protocol::ClientRequest;
use crate::network::relay::Relay;
use crate::network::server::ServerError;
use crate::network::session::Session;

/// Routes inbound frames to the handshake, auth and relay handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    auth: AuthService,
    relay: Relay,
    max_frame_size: usize,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(auth: AuthService, relay: Relay, max_frame_size: usize) -> Self {
        Self {
            auth,
            relay,
            max_frame_size,
        }
    }

    /// Auth handlers.
    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    /// Relay.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Handle one frame body. An error means the connection must close.
    pub async fn handle_frame(&self, session: &mut Session, body: &[u8]) -> Result<(), ServerError> {
        if session.handshake().state() == HandshakeState::KeyNotSent {
            return self.handle_public_key(session, body).await;
        }

        let packet = open_packet(body, session.key(), self.max_frame_size)?;
        self.handle_packet(session, &packet).await;
        Ok(())
    }

    #[instrument(skip_all, fields(session = %session.id(), addr = %session.addr()))]
    async fn handle_public_key(&self, session: &mut Session, body: &[u8]) -> Result<(), ServerError> {
        let reply = session
            .handshake_mut()
            .accept_public_key(body, self.max_frame_size)?;

        debug!(key = %session.key().fingerprint(), "Public key accepted, sending session key");
        if !session.handle().send_handshake(reply).await {
            debug!("Writer closed before the session key was sent");
        }
        Ok(())
    }

    /// Handle one decrypted packet.
    pub async fn handle_packet(&self, session: &mut Session, packet: &Packet) {
        let request = match ClientRequest::try_from(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!(session = %session.id(), key = packet.key(), error = %e, "Ignoring packet");
                return;
            }
        };

        if !session.is_secure() {
            if matches!(request, ClientRequest::SecureConnectionEstablished)
                && session.handshake_mut().confirm(packet)
            {
                info!(session = %session.id(), addr = %session.addr(), "Secure connection established");
            } else {
                debug!(session = %session.id(), key = packet.key(), "Ignoring packet before secure channel");
            }
            return;
        }

        let logged_in = session.is_logged_in();
        match request {
            ClientRequest::NewAccount {
                email,
                username,
                password,
            } if !logged_in => {
                self.auth.register(session, &email, &username, &password).await;
            }
            ClientRequest::VerifyEmail { code } if !logged_in => {
                self.auth.verify_email(session, &code).await;
            }
            ClientRequest::Login {
                identifier,
                password,
            } if !logged_in => {
                self.auth.login(session, &identifier, &password).await;
            }
            ClientRequest::PostConnect if logged_in => {
                self.auth.post_login(session).await;
            }
            ClientRequest::Logout if logged_in => {
                self.auth.logout(session).await;
            }
            ClientRequest::Relay(event) if logged_in => {
                self.relay.forward(session, event).await;
            }
            _ => {
                debug!(
                    session = %session.id(),
                    key = packet.key(),
                    logged_in,
                    "Request not valid in this session state"
                );
            }
        }
    }
}
