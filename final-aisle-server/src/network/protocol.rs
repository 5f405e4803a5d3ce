//! Protocol Messages
//!
//! Closed message vocabulary carried over the packet model. Every key has a
//! fixed payload shape; conversions here check the shape so handlers only
//! ever see typed values.

use std::fmt;
use std::str::FromStr;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::packet::{Composite, Packet, PacketError, PacketKind};
use crate::network::auth::RegistrationRejection;
use crate::network::session::SessionId;
use crate::storage::accounts::AccountId;

// =============================================================================
// MESSAGE KEYS
// =============================================================================

/// Every packet key understood by either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Client sentinel confirming the symmetric key.
    SecureConnectionEstablished,
    /// Start a registration.
    TryNewAccount,
    /// Submit a verification code.
    TryVerifyEmail,
    /// Log in by email or username.
    TryLogin,
    /// Explicit logout.
    Logout,
    /// Registration email is in use.
    EmailAlreadyTaken,
    /// Registration username is in use.
    UsernameAlreadyTaken,
    /// Verification code was sent.
    EmailVerifySent,
    /// Verification succeeded, account created.
    EmailVerifySuccess,
    /// Verification failed, carries tries remaining.
    EmailVerifyFail,
    /// Registration failed server-side validation.
    RegistrationRejected,
    /// Login accepted.
    LoginSuccess,
    /// Login rejected.
    LoginFail,
    /// Position update.
    TransformPosition,
    /// Rotation update.
    TransformRotation,
    /// Movement input vector.
    MovementInput,
    /// Roll angle.
    MovementRoll,
    /// Jump.
    MovementJump,
    /// Prone toggle.
    MovementToggleProne,
    /// A player came online.
    PlayerConnected,
    /// A player went offline.
    PlayerDisconnected,
    /// Roster replay request after login.
    PlayerPostConnect,
}

impl MessageKey {
    /// All keys.
    pub const ALL: [MessageKey; 22] = [
        MessageKey::SecureConnectionEstablished,
        MessageKey::TryNewAccount,
        MessageKey::TryVerifyEmail,
        MessageKey::TryLogin,
        MessageKey::Logout,
        MessageKey::EmailAlreadyTaken,
        MessageKey::UsernameAlreadyTaken,
        MessageKey::EmailVerifySent,
        MessageKey::EmailVerifySuccess,
        MessageKey::EmailVerifyFail,
        MessageKey::RegistrationRejected,
        MessageKey::LoginSuccess,
        MessageKey::LoginFail,
        MessageKey::TransformPosition,
        MessageKey::TransformRotation,
        MessageKey::MovementInput,
        MessageKey::MovementRoll,
        MessageKey::MovementJump,
        MessageKey::MovementToggleProne,
        MessageKey::PlayerConnected,
        MessageKey::PlayerDisconnected,
        MessageKey::PlayerPostConnect,
    ];

    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKey::SecureConnectionEstablished => "SecureConnectionEstablished",
            MessageKey::TryNewAccount => "TryNewAccount",
            MessageKey::TryVerifyEmail => "TryVerifyEmail",
            MessageKey::TryLogin => "TryLogin",
            MessageKey::Logout => "Logout",
            MessageKey::EmailAlreadyTaken => "EmailAlreadyTaken",
            MessageKey::UsernameAlreadyTaken => "UsernameAlreadyTaken",
            MessageKey::EmailVerifySent => "EmailVerifySent",
            MessageKey::EmailVerifySuccess => "EmailVerifySuccess",
            MessageKey::EmailVerifyFail => "EmailVerifyFail",
            MessageKey::RegistrationRejected => "RegistrationRejected",
            MessageKey::LoginSuccess => "LoginSuccess",
            MessageKey::LoginFail => "LoginFail",
            MessageKey::TransformPosition => "TransformPosition",
            MessageKey::TransformRotation => "TransformRotation",
            MessageKey::MovementInput => "MovementInput",
            MessageKey::MovementRoll => "MovementRoll",
            MessageKey::MovementJump => "MovementJump",
            MessageKey::MovementToggleProne => "MovementToggleProne",
            MessageKey::PlayerConnected => "PlayerConnected",
            MessageKey::PlayerDisconnected => "PlayerDisconnected",
            MessageKey::PlayerPostConnect => "PlayerPostConnect",
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKey(s.to_owned()))
    }
}

impl From<MessageKey> for String {
    fn from(key: MessageKey) -> Self {
        key.as_str().to_owned()
    }
}

/// Protocol errors. Never fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Key is not part of the vocabulary.
    #[error("unknown message key: {0}")]
    UnknownKey(String),

    /// Payload kind does not match the key's shape.
    #[error("{key} expects a {expected} payload, got {found}")]
    PayloadMismatch {
        /// Message key.
        key: MessageKey,
        /// Kind the key requires.
        expected: PacketKind,
        /// Kind received.
        found: PacketKind,
    },

    /// Key is known but only flows server to client.
    #[error("{0} is not a client request")]
    NotARequest(MessageKey),

    /// Key is known but only flows client to server.
    #[error("{0} is not a server message")]
    NotAServerMessage(MessageKey),

    /// Enum payload names an unknown variant.
    #[error("unknown variant: {0}")]
    UnknownVariant(String),

    /// Value is outside the accepted range.
    #[error("invalid {key} value: {reason}")]
    InvalidValue {
        /// Message key.
        key: MessageKey,
        /// What was wrong.
        reason: &'static str,
    },

    /// Composite payload has the wrong element count or types.
    #[error("composite payload: {0}")]
    Composite(#[from] PacketError),
}

fn expect_kind(key: MessageKey, packet: &Packet, expected: PacketKind) -> Result<(), ProtocolError> {
    let found = packet.kind();
    if found != expected {
        return Err(ProtocolError::PayloadMismatch { key, expected, found });
    }
    Ok(())
}

fn expect_composite(key: MessageKey, packet: &Packet) -> Result<&Composite, ProtocolError> {
    packet.as_composite().ok_or(ProtocolError::PayloadMismatch {
        key,
        expected: PacketKind::Composite,
        found: packet.kind(),
    })
}

fn expect_float(key: MessageKey, packet: &Packet) -> Result<f32, ProtocolError> {
    packet.as_float().ok_or(ProtocolError::PayloadMismatch {
        key,
        expected: PacketKind::Float,
        found: packet.kind(),
    })
}

fn expect_int(key: MessageKey, packet: &Packet) -> Result<i32, ProtocolError> {
    packet.as_int().ok_or(ProtocolError::PayloadMismatch {
        key,
        expected: PacketKind::Integer,
        found: packet.kind(),
    })
}

// =============================================================================
// CHARACTERS
// =============================================================================

/// Character class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlayerClass {
    /// No class chosen yet.
    #[default]
    Blank,
}

impl fmt::Display for PlayerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerClass::Blank => f.write_str("Blank"),
        }
    }
}

impl FromStr for PlayerClass {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Blank" => Ok(PlayerClass::Blank),
            other => Err(ProtocolError::UnknownVariant(other.to_owned())),
        }
    }
}

/// Character race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlayerRace {
    /// The only playable race.
    #[default]
    Turtle,
}

impl fmt::Display for PlayerRace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerRace::Turtle => f.write_str("Turtle"),
        }
    }
}

impl FromStr for PlayerRace {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Turtle" => Ok(PlayerRace::Turtle),
            other => Err(ProtocolError::UnknownVariant(other.to_owned())),
        }
    }
}

/// Public view of an online player, sent with `PlayerConnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterSummary {
    /// Session the player is connected on.
    pub session: SessionId,
    /// Owning account.
    pub account: AccountId,
    /// Character name.
    pub name: String,
    /// Class.
    pub class: PlayerClass,
    /// Race.
    pub race: PlayerRace,
}

impl CharacterSummary {
    /// `[session id, account id, name, class, race]`.
    pub fn to_composite(&self) -> Composite {
        Composite::new()
            .with_int(self.session.get())
            .with_string(self.account.to_string())
            .with_string(self.name.clone())
            .with_enum(self.class)
            .with_enum(self.race)
    }

    /// Parse the composite produced by [`CharacterSummary::to_composite`].
    pub fn from_composite(composite: &Composite) -> Result<Self, ProtocolError> {
        let account = composite
            .get_str(1)?
            .parse()
            .map_err(|_| ProtocolError::InvalidValue {
                key: MessageKey::PlayerConnected,
                reason: "account id is not a uuid",
            })?;

        Ok(Self {
            session: SessionId::new(composite.get_int(0)?),
            account,
            name: composite.get_str(2)?.to_owned(),
            class: composite.get_enum(3)?,
            race: composite.get_enum(4)?,
        })
    }
}

// =============================================================================
// RELAY EVENTS
// =============================================================================

/// Movement and transform events fanned out to other players.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelayEvent {
    /// World position.
    Position {
        /// X.
        x: f32,
        /// Y.
        y: f32,
        /// Z.
        z: f32,
    },
    /// Facing rotation.
    Rotation(f32),
    /// Movement input vector.
    Input {
        /// Horizontal axis.
        x: f32,
        /// Vertical axis.
        y: f32,
    },
    /// Roll angle.
    Roll(f32),
    /// Jump.
    Jump,
    /// Prone state after the toggle.
    ToggleProne(bool),
}

impl RelayEvent {
    /// Key this event travels under.
    pub fn key(&self) -> MessageKey {
        match self {
            RelayEvent::Position { .. } => MessageKey::TransformPosition,
            RelayEvent::Rotation(_) => MessageKey::TransformRotation,
            RelayEvent::Input { .. } => MessageKey::MovementInput,
            RelayEvent::Roll(_) => MessageKey::MovementRoll,
            RelayEvent::Jump => MessageKey::MovementJump,
            RelayEvent::ToggleProne(_) => MessageKey::MovementToggleProne,
        }
    }

    /// Client to server shape.
    pub fn to_request(&self) -> Packet {
        let key = self.key();
        match *self {
            RelayEvent::Position { x, y, z } => Packet::composite(
                key,
                Composite::new().with_float(x).with_float(y).with_float(z),
            ),
            RelayEvent::Rotation(r) | RelayEvent::Roll(r) => Packet::float(key, r),
            RelayEvent::Input { x, y } => {
                Packet::composite(key, Composite::new().with_float(x).with_float(y))
            }
            RelayEvent::Jump => Packet::empty(key),
            RelayEvent::ToggleProne(prone) => Packet::boolean(key, prone),
        }
    }

    /// Parse the client to server shape.
    pub fn from_request(key: MessageKey, packet: &Packet) -> Result<Self, ProtocolError> {
        match key {
            MessageKey::TransformPosition => {
                let c = expect_composite(key, packet)?;
                Ok(RelayEvent::Position {
                    x: c.get_float(0)?,
                    y: c.get_float(1)?,
                    z: c.get_float(2)?,
                })
            }
            MessageKey::TransformRotation => Ok(RelayEvent::Rotation(expect_float(key, packet)?)),
            MessageKey::MovementInput => {
                let c = expect_composite(key, packet)?;
                Ok(RelayEvent::Input {
                    x: c.get_float(0)?,
                    y: c.get_float(1)?,
                })
            }
            MessageKey::MovementRoll => Ok(RelayEvent::Roll(expect_float(key, packet)?)),
            MessageKey::MovementJump => {
                expect_kind(key, packet, PacketKind::Empty)?;
                Ok(RelayEvent::Jump)
            }
            MessageKey::MovementToggleProne => {
                let prone = packet.as_bool().ok_or(ProtocolError::PayloadMismatch {
                    key,
                    expected: PacketKind::Boolean,
                    found: packet.kind(),
                })?;
                Ok(RelayEvent::ToggleProne(prone))
            }
            other => Err(ProtocolError::NotARequest(other)),
        }
    }

    /// Server to others shape, tagged with the sender's session id.
    pub fn to_relay(&self, sender: SessionId) -> Packet {
        let key = self.key();
        let id = sender.get();
        match *self {
            RelayEvent::Position { x, y, z } => Packet::composite(
                key,
                Composite::new()
                    .with_int(id)
                    .with_float(x)
                    .with_float(y)
                    .with_float(z),
            ),
            RelayEvent::Rotation(r) | RelayEvent::Roll(r) => {
                Packet::composite(key, Composite::new().with_int(id).with_float(r))
            }
            RelayEvent::Input { x, y } => Packet::composite(
                key,
                Composite::new().with_int(id).with_float(x).with_float(y),
            ),
            RelayEvent::Jump => Packet::integer(key, id),
            RelayEvent::ToggleProne(prone) => {
                Packet::composite(key, Composite::new().with_int(id).with_bool(prone))
            }
        }
    }

    /// Parse the server to others shape.
    pub fn from_relay(key: MessageKey, packet: &Packet) -> Result<(SessionId, Self), ProtocolError> {
        if key == MessageKey::MovementJump {
            return Ok((SessionId::new(expect_int(key, packet)?), RelayEvent::Jump));
        }

        let c = expect_composite(key, packet)?;
        let sender = SessionId::new(c.get_int(0)?);
        let event = match key {
            MessageKey::TransformPosition => RelayEvent::Position {
                x: c.get_float(1)?,
                y: c.get_float(2)?,
                z: c.get_float(3)?,
            },
            MessageKey::TransformRotation => RelayEvent::Rotation(c.get_float(1)?),
            MessageKey::MovementInput => RelayEvent::Input {
                x: c.get_float(1)?,
                y: c.get_float(2)?,
            },
            MessageKey::MovementRoll => RelayEvent::Roll(c.get_float(1)?),
            MessageKey::MovementToggleProne => RelayEvent::ToggleProne(c.get_bool(1)?),
            other => return Err(ProtocolError::NotAServerMessage(other)),
        };
        Ok((sender, event))
    }
}

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Password received from a client. `Debug` never shows the contents.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl Password {
    /// Wrap a plaintext password.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

    /// One `*` per character, for logs.
    pub fn masked(&self) -> String {
        "*".repeat(self.char_len())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password({})", self.masked())
    }
}

/// Requests a client may send once the channel is secure.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Handshake sentinel.
    SecureConnectionEstablished,
    /// `TryNewAccount`.
    NewAccount {
        /// Email address.
        email: String,
        /// Desired username.
        username: String,
        /// Password.
        password: Password,
    },
    /// `TryVerifyEmail`.
    VerifyEmail {
        /// Code from the verification email.
        code: String,
    },
    /// `TryLogin`.
    Login {
        /// Email or username.
        identifier: String,
        /// Password.
        password: Password,
    },
    /// `PlayerPostConnect`.
    PostConnect,
    /// `Logout`.
    Logout,
    /// Movement and transform events.
    Relay(RelayEvent),
}

impl ClientRequest {
    /// Encode as a packet.
    pub fn to_packet(&self) -> Packet {
        match self {
            ClientRequest::SecureConnectionEstablished => {
                Packet::empty(MessageKey::SecureConnectionEstablished)
            }
            ClientRequest::NewAccount { email, username, password } => Packet::composite(
                MessageKey::TryNewAccount,
                Composite::new()
                    .with_string(email.clone())
                    .with_string(username.clone())
                    .with_string(password.expose()),
            ),
            ClientRequest::VerifyEmail { code } => {
                Packet::string(MessageKey::TryVerifyEmail, code.clone())
            }
            ClientRequest::Login { identifier, password } => Packet::composite(
                MessageKey::TryLogin,
                Composite::new()
                    .with_string(identifier.clone())
                    .with_string(password.expose()),
            ),
            ClientRequest::PostConnect => Packet::empty(MessageKey::PlayerPostConnect),
            ClientRequest::Logout => Packet::empty(MessageKey::Logout),
            ClientRequest::Relay(event) => event.to_request(),
        }
    }
}

impl TryFrom<&Packet> for ClientRequest {
    type Error = ProtocolError;

    fn try_from(packet: &Packet) -> Result<Self, Self::Error> {
        let key: MessageKey = packet.key().parse()?;
        match key {
            MessageKey::SecureConnectionEstablished => {
                expect_kind(key, packet, PacketKind::Empty)?;
                Ok(ClientRequest::SecureConnectionEstablished)
            }
            MessageKey::TryNewAccount => {
                let c = expect_composite(key, packet)?;
                Ok(ClientRequest::NewAccount {
                    email: c.get_str(0)?.to_owned(),
                    username: c.get_str(1)?.to_owned(),
                    password: Password::new(c.get_str(2)?),
                })
            }
            MessageKey::TryVerifyEmail => {
                let code = packet.as_str().ok_or(ProtocolError::PayloadMismatch {
                    key,
                    expected: PacketKind::String,
                    found: packet.kind(),
                })?;
                Ok(ClientRequest::VerifyEmail { code: code.to_owned() })
            }
            MessageKey::TryLogin => {
                let c = expect_composite(key, packet)?;
                Ok(ClientRequest::Login {
                    identifier: c.get_str(0)?.to_owned(),
                    password: Password::new(c.get_str(1)?),
                })
            }
            MessageKey::PlayerPostConnect => {
                expect_kind(key, packet, PacketKind::Empty)?;
                Ok(ClientRequest::PostConnect)
            }
            MessageKey::Logout => {
                expect_kind(key, packet, PacketKind::Empty)?;
                Ok(ClientRequest::Logout)
            }
            _ => RelayEvent::from_request(key, packet).map(ClientRequest::Relay),
        }
    }
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Registration email is in use.
    EmailAlreadyTaken,
    /// Registration username is in use.
    UsernameAlreadyTaken,
    /// Verification code was sent.
    EmailVerifySent,
    /// Account created.
    EmailVerifySuccess,
    /// Wrong code; zero means the registration was discarded.
    EmailVerifyFail {
        /// Attempts left.
        tries_remaining: u32,
    },
    /// Registration failed server-side validation.
    RegistrationRejected(RegistrationRejection),
    /// Login accepted.
    LoginSuccess,
    /// Login rejected.
    LoginFail,
    /// Another player is online.
    PlayerConnected(CharacterSummary),
    /// Another player went offline.
    PlayerDisconnected(SessionId),
    /// Movement from another player.
    Relayed {
        /// Originating session.
        sender: SessionId,
        /// The event.
        event: RelayEvent,
    },
}

impl ServerMessage {
    /// Key this message travels under.
    pub fn key(&self) -> MessageKey {
        match self {
            ServerMessage::EmailAlreadyTaken => MessageKey::EmailAlreadyTaken,
            ServerMessage::UsernameAlreadyTaken => MessageKey::UsernameAlreadyTaken,
            ServerMessage::EmailVerifySent => MessageKey::EmailVerifySent,
            ServerMessage::EmailVerifySuccess => MessageKey::EmailVerifySuccess,
            ServerMessage::EmailVerifyFail { .. } => MessageKey::EmailVerifyFail,
            ServerMessage::RegistrationRejected(_) => MessageKey::RegistrationRejected,
            ServerMessage::LoginSuccess => MessageKey::LoginSuccess,
            ServerMessage::LoginFail => MessageKey::LoginFail,
            ServerMessage::PlayerConnected(_) => MessageKey::PlayerConnected,
            ServerMessage::PlayerDisconnected(_) => MessageKey::PlayerDisconnected,
            ServerMessage::Relayed { event, .. } => event.key(),
        }
    }

    /// Encode as a packet.
    pub fn to_packet(&self) -> Packet {
        let key = self.key();
        match self {
            ServerMessage::EmailVerifyFail { tries_remaining } => {
                Packet::integer(key, i32::try_from(*tries_remaining).unwrap_or(i32::MAX))
            }
            ServerMessage::RegistrationRejected(reason) => Packet::enumeration(key, reason),
            ServerMessage::PlayerConnected(summary) => {
                Packet::composite(key, summary.to_composite())
            }
            ServerMessage::PlayerDisconnected(id) => Packet::integer(key, id.get()),
            ServerMessage::Relayed { sender, event } => event.to_relay(*sender),
            _ => Packet::empty(key),
        }
    }

    /// Parse a packet received from the server.
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        let key: MessageKey = packet.key().parse()?;
        let empty = |message: ServerMessage| {
            expect_kind(key, packet, PacketKind::Empty).map(|_| message)
        };

        match key {
            MessageKey::EmailAlreadyTaken => empty(ServerMessage::EmailAlreadyTaken),
            MessageKey::UsernameAlreadyTaken => empty(ServerMessage::UsernameAlreadyTaken),
            MessageKey::EmailVerifySent => empty(ServerMessage::EmailVerifySent),
            MessageKey::EmailVerifySuccess => empty(ServerMessage::EmailVerifySuccess),
            MessageKey::LoginSuccess => empty(ServerMessage::LoginSuccess),
            MessageKey::LoginFail => empty(ServerMessage::LoginFail),
            MessageKey::EmailVerifyFail => {
                let tries = expect_int(key, packet)?;
                let tries_remaining = u32::try_from(tries).map_err(|_| {
                    ProtocolError::InvalidValue { key, reason: "negative tries" }
                })?;
                Ok(ServerMessage::EmailVerifyFail { tries_remaining })
            }
            MessageKey::RegistrationRejected => {
                expect_kind(key, packet, PacketKind::Enum)?;
                let name = packet.as_enum_name().unwrap_or_default();
                Ok(ServerMessage::RegistrationRejected(name.parse()?))
            }
            MessageKey::PlayerConnected => {
                let c = expect_composite(key, packet)?;
                Ok(ServerMessage::PlayerConnected(CharacterSummary::from_composite(c)?))
            }
            MessageKey::PlayerDisconnected => Ok(ServerMessage::PlayerDisconnected(
                SessionId::new(expect_int(key, packet)?),
            )),
            MessageKey::TransformPosition
            | MessageKey::TransformRotation
            | MessageKey::MovementInput
            | MessageKey::MovementRoll
            | MessageKey::MovementJump
            | MessageKey::MovementToggleProne => {
                let (sender, event) = RelayEvent::from_relay(key, packet)?;
                Ok(ServerMessage::Relayed { sender, event })
            }
            other => Err(ProtocolError::NotAServerMessage(other)),
        }
    }
}
