//! Registration and Login
//!
//! ```text
//! Anonymous --TryNewAccount--> Pending(code, tries) --code ok--> LoggedIn
//!     |                           |  wrong code: tries - 1, 0 discards
//!     +--------TryLogin--------------------------------------> LoggedIn
//! ```
//!
//! Business rejections are answered with a response key, never an error.
//! Every check-then-mutate step runs under the session manager's lock.
//! Nothing awaits a peer's queue while that lock is held: replies go into a
//! slot reserved beforehand, and roster updates to other players evict a
//! peer whose queue is full.

use std::collections::btree_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::network::env_or;
use crate::network::mail::{verification_email, Email, Mailer};
use crate::network::protocol::{Password, ProtocolError, ServerMessage};
use crate::network::session::{OnlineEntry, Registry, Session, SessionHandle, SessionId, SessionManager};
use crate::storage::accounts::{Account, StorageError};

/// Verification code length.
pub const VERIFY_CODE_LEN: usize = 6;

const CODE_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Minimum password length in characters.
    pub min_password_len: usize,
    /// Verification attempts per registration.
    pub verify_email_tries: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_password_len: 8,
            verify_email_tries: 5,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_password_len: env_or("FINAL_AISLE_MIN_PASSWORD_LEN", defaults.min_password_len),
            verify_email_tries: env_or("FINAL_AISLE_VERIFY_TRIES", defaults.verify_email_tries)
                .max(1),
        }
    }
}

/// Why a registration failed server-side validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationRejection {
    /// Email is blank.
    EmptyEmail,
    /// Email is not `local@domain`.
    InvalidEmail,
    /// Username is blank.
    EmptyUsername,
    /// Username contains control characters.
    InvalidUsername,
    /// Password is shorter than the configured minimum.
    PasswordTooShort,
}

impl fmt::Display for RegistrationRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for RegistrationRejection {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EmptyEmail" => Ok(Self::EmptyEmail),
            "InvalidEmail" => Ok(Self::InvalidEmail),
            "EmptyUsername" => Ok(Self::EmptyUsername),
            "InvalidUsername" => Ok(Self::InvalidUsername),
            "PasswordTooShort" => Ok(Self::PasswordTooShort),
            other => Err(ProtocolError::UnknownVariant(other.to_owned())),
        }
    }
}

/// Check registration fields regardless of what the client checked.
pub fn validate_registration(
    config: &AuthConfig,
    email: &str,
    username: &str,
    password: &Password,
) -> Result<(), RegistrationRejection> {
    if email.trim().is_empty() {
        return Err(RegistrationRejection::EmptyEmail);
    }
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty() && !domain.contains('@'));
    if !well_formed || email.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(RegistrationRejection::InvalidEmail);
    }
    if username.trim().is_empty() {
        return Err(RegistrationRejection::EmptyUsername);
    }
    if username.chars().any(char::is_control) {
        return Err(RegistrationRejection::InvalidUsername);
    }
    if password.char_len() < config.min_password_len {
        return Err(RegistrationRejection::PasswordTooShort);
    }
    Ok(())
}

/// Six characters from `0-9A-Z`; the third is always a digit.
pub fn generate_verification_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..VERIFY_CODE_LEN)
        .map(|i| {
            let range = if i == 2 { 10 } else { CODE_ALPHABET.len() };
            CODE_ALPHABET[rng.gen_range(0..range)] as char
        })
        .collect()
}

/// Registration awaiting its verification code.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    /// Email address.
    pub email: String,
    /// Username.
    pub username: String,
    /// Password.
    pub password: Password,
    /// Code that was mailed.
    pub code: String,
    /// Attempts left before the record is discarded.
    pub tries_remaining: u32,
}

// =============================================================================
// SERVICE
// =============================================================================

/// Registration, verification, login and logout handlers.
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
    sessions: Arc<SessionManager>,
    mailer: Arc<dyn Mailer>,
}

impl AuthService {
    /// Create the service.
    pub fn new(config: AuthConfig, sessions: Arc<SessionManager>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            config,
            sessions,
            mailer,
        }
    }

    /// Configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Shared session state.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// `TryNewAccount`.
    pub async fn register(&self, session: &Session, email: &str, username: &str, password: &Password) {
        let id = session.id();
        info!(
            session = %id,
            addr = %session.addr(),
            email,
            username,
            password = %password.masked(),
            "Account creation requested"
        );

        if let Err(reason) = validate_registration(&self.config, email, username, password) {
            info!(session = %id, %reason, "Registration rejected");
            session.send(ServerMessage::RegistrationRejected(reason)).await;
            return;
        }

        let mut registry = self.sessions.registry().await;
        if registry.accounts.lookup_email(email).is_some() {
            drop(registry);
            info!(session = %id, "Email already taken");
            session.send(ServerMessage::EmailAlreadyTaken).await;
            return;
        }
        if registry.accounts.lookup_username(username).is_some() {
            drop(registry);
            info!(session = %id, "Username already taken");
            session.send(ServerMessage::UsernameAlreadyTaken).await;
            return;
        }

        let tries = self.config.verify_email_tries;
        let code = match registry.pending.entry(id) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.email = email.to_owned();
                pending.username = username.to_owned();
                pending.password = password.clone();
                pending.tries_remaining = tries;
                pending.code.clone()
            }
            Entry::Vacant(entry) => {
                let code = generate_verification_code(&mut OsRng);
                entry.insert(PendingRegistration {
                    email: email.to_owned(),
                    username: username.to_owned(),
                    password: password.clone(),
                    code: code.clone(),
                    tries_remaining: tries,
                });
                code
            }
        };
        drop(registry);

        session.send(ServerMessage::EmailVerifySent).await;
        self.dispatch_mail(verification_email(email, username, &code));
    }

    /// `TryVerifyEmail`. Ignored when no registration is pending.
    pub async fn verify_email(&self, session: &mut Session, code: &str) {
        let id = session.id();
        let handle = session.handle().clone();
        let Some(reply) = handle.reserve().await else {
            return;
        };
        let mut registry = self.sessions.registry().await;

        let outcome = match registry.pending.entry(id) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut entry) => {
                if entry.get().code.eq_ignore_ascii_case(code.trim()) {
                    Some(Ok(entry.remove()))
                } else {
                    let pending = entry.get_mut();
                    pending.tries_remaining = pending.tries_remaining.saturating_sub(1);
                    let tries_remaining = pending.tries_remaining;
                    if tries_remaining == 0 {
                        entry.remove();
                    }
                    Some(Err(tries_remaining))
                }
            }
        };

        let pending = match outcome {
            None => {
                debug!(session = %id, "Verification code without a pending registration");
                return;
            }
            Some(Err(tries_remaining)) => {
                drop(registry);
                info!(session = %id, tries_remaining, "Email verification failed");
                reply.send(ServerMessage::EmailVerifyFail { tries_remaining });
                return;
            }
            Some(Ok(pending)) => pending,
        };

        let created = registry.accounts.create(
            &pending.email,
            &pending.username,
            pending.password.expose(),
        );
        let account = match created {
            Ok(account) => account,
            Err(e) => {
                drop(registry);
                reply.send(match e {
                    StorageError::EmailTaken => ServerMessage::EmailAlreadyTaken,
                    StorageError::UsernameTaken => ServerMessage::UsernameAlreadyTaken,
                    other => {
                        error!(session = %id, error = %other, "Failed to persist account");
                        ServerMessage::EmailVerifyFail { tries_remaining: 0 }
                    }
                });
                return;
            }
        };

        info!(session = %id, email = %pending.email, "Email verified");
        reply.send(ServerMessage::EmailVerifySuccess);
        let others = admit(&mut registry, session, &account);
        drop(registry);

        self.announce(session, account, others);
    }

    /// `TryLogin`. Every failure answers the same `LoginFail`.
    pub async fn login(&self, session: &mut Session, identifier: &str, password: &Password) {
        let id = session.id();
        let handle = session.handle().clone();
        let Some(reply) = handle.reserve().await else {
            return;
        };
        let mut registry = self.sessions.registry().await;

        let account = registry
            .accounts
            .resolve(identifier)
            .filter(|account| registry.accounts.check_password(*account, password.expose()))
            .and_then(|account| registry.accounts.load(account));

        let account = match account {
            Some(account) if !registry.is_account_online(account.id) => account,
            Some(account) => {
                drop(registry);
                info!(session = %id, username = %account.username, "Login refused, account already online");
                reply.send(ServerMessage::LoginFail);
                return;
            }
            None => {
                drop(registry);
                info!(session = %id, addr = %session.addr(), "Login failed");
                reply.send(ServerMessage::LoginFail);
                return;
            }
        };

        reply.send(ServerMessage::LoginSuccess);
        let others = admit(&mut registry, session, &account);
        drop(registry);

        self.announce(session, account, others);
    }

    /// `PlayerPostConnect`: replay the roster to the requester only.
    pub async fn post_login(&self, session: &Session) {
        if !session.is_logged_in() {
            return;
        }

        let roster = self.sessions.roster_except(session.id()).await;
        debug!(session = %session.id(), players = roster.len(), "Replaying roster");
        for summary in roster {
            session.send(ServerMessage::PlayerConnected(summary)).await;
        }
    }

    /// Leave the online directory and tell everyone still online.
    pub async fn logout(&self, session: &mut Session) {
        let Some(account) = session.log_out() else {
            return;
        };

        let remaining = {
            let mut registry = self.sessions.registry().await;
            registry.online.remove(&session.id());
            registry.online_except(session.id())
        };

        info!(session = %session.id(), username = %account.username, "Player logged out");
        broadcast_disconnect(session.id(), remaining);
    }

    /// Connection closed: drop all state for the session.
    pub async fn disconnect(&self, session: &mut Session) {
        let account = session.log_out();
        let was_online = self.sessions.unregister(session.id()).await.is_some();

        if was_online {
            if let Some(account) = account {
                info!(session = %session.id(), username = %account.username, "Player logged out");
            }
            let remaining = self.sessions.online_except(session.id()).await;
            broadcast_disconnect(session.id(), remaining);
        }
    }

    fn announce(&self, session: &mut Session, account: Account, others: Vec<SessionHandle>) {
        info!(
            session = %session.id(),
            username = %account.username,
            addr = %session.addr(),
            "Player logged in"
        );

        let summary = account.summary(session.id());
        session.log_in(account);
        for handle in others {
            handle.send_or_evict(ServerMessage::PlayerConnected(summary.clone()));
        }
    }

    fn dispatch_mail(&self, email: Email) {
        let mailer = Arc::clone(&self.mailer);
        tokio::task::spawn_blocking(move || match mailer.send(&email) {
            Ok(()) => debug!(to = %email.to, "Verification email sent"),
            Err(e) => warn!(to = %email.to, error = %e, "Verification email failed"),
        });
    }
}

impl fmt::Debug for AuthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Put `session` in the online directory; returns everyone else online.
fn admit(registry: &mut Registry, session: &Session, account: &Account) -> Vec<SessionHandle> {
    let others = registry.online_except(session.id());
    registry.online.insert(
        session.id(),
        OnlineEntry {
            handle: session.handle().clone(),
            summary: account.summary(session.id()),
        },
    );
    others
}

/// Roster updates never wait on a peer: a full queue evicts that peer.
fn broadcast_disconnect(id: SessionId, remaining: Vec<SessionHandle>) {
    for handle in remaining {
        handle.send_or_evict(ServerMessage::PlayerDisconnected(id));
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::SymmetricKey;
    use crate::core::packet::Packet;
    use crate::network::mail::MemoryMailer;
    use crate::network::session::{Outbound, SessionId};
    use crate::storage::accounts::AccountDirectory;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        auth: AuthService,
        mailer: Arc<MemoryMailer>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let accounts = AccountDirectory::open_with_key(dir.path(), SymmetricKey::generate()).unwrap();
        let sessions = Arc::new(SessionManager::new(accounts));
        let mailer = Arc::new(MemoryMailer::new());
        let auth = AuthService::new(AuthConfig::default(), sessions, mailer.clone());
        Harness { auth, mailer, _dir: dir }
    }

    async fn connect(h: &Harness) -> (Session, mpsc::Receiver<Outbound>) {
        connect_with_queue(h, 64).await
    }

    async fn connect_with_queue(h: &Harness, capacity: usize) -> (Session, mpsc::Receiver<Outbound>) {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (handle, rx) = SessionHandle::channel(h.auth.sessions().next_id().unwrap(), addr, capacity);
        h.auth.sessions().register(handle.clone()).await;
        (Session::new(handle), rx)
    }

    fn fill(session: &Session) {
        while session.handle().try_send_packet(Packet::empty("MovementJump")) {}
    }

    fn next(rx: &mut mpsc::Receiver<Outbound>) -> ServerMessage {
        match rx.try_recv().expect("expected a message") {
            Outbound::Packet(packet) => ServerMessage::from_packet(&packet).unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn pending_code(h: &Harness, id: SessionId) -> String {
        h.auth.sessions().registry().await.pending[&id].code.clone()
    }

    async fn create_account(h: &Harness, email: &str, username: &str) -> Account {
        h.auth
            .sessions()
            .registry()
            .await
            .accounts
            .create(email, username, "password1")
            .unwrap()
    }

    fn pw(value: &str) -> Password {
        Password::new(value)
    }

    #[test]
    fn test_verification_code_format() {
        for _ in 0..500 {
            let code = generate_verification_code(&mut OsRng);
            assert_eq!(code.len(), VERIFY_CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(code.as_bytes()[2].is_ascii_digit());
        }
    }

    #[test]
    fn test_validation() {
        let config = AuthConfig::default();
        let ok = pw("password1");
        assert_eq!(validate_registration(&config, "a@b.com", "alice", &ok), Ok(()));
        assert_eq!(
            validate_registration(&config, " ", "alice", &ok),
            Err(RegistrationRejection::EmptyEmail)
        );
        assert_eq!(
            validate_registration(&config, "not-an-email", "alice", &ok),
            Err(RegistrationRejection::InvalidEmail)
        );
        assert_eq!(
            validate_registration(&config, "a@b.com", "", &ok),
            Err(RegistrationRejection::EmptyUsername)
        );
        assert_eq!(
            validate_registration(&config, "a@b.com", "al\nice", &ok),
            Err(RegistrationRejection::InvalidUsername)
        );
        assert_eq!(
            validate_registration(&config, "a@b.com", "alice", &pw("short")),
            Err(RegistrationRejection::PasswordTooShort)
        );
    }

    #[tokio::test]
    async fn test_register_sends_code() {
        let h = harness();
        let (session, mut rx) = connect(&h).await;

        h.auth.register(&session, "a@b.com", "alice", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifySent);
        assert_eq!(h.auth.sessions().pending_count().await, 1);

        let code = pending_code(&h, session.id()).await;
        for _ in 0..100 {
            if !h.mailer.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b.com");
        assert!(sent[0].html_body.contains(&code));
    }

    #[tokio::test]
    async fn test_reregistration_reuses_code() {
        let h = harness();
        let (mut session, mut rx) = connect(&h).await;

        h.auth.register(&session, "a@b.com", "alice", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifySent);
        let first = pending_code(&h, session.id()).await;

        h.auth.verify_email(&mut session, "WRONG!").await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifyFail { tries_remaining: 4 });

        h.auth.register(&session, "a@b.com", "alicia", &pw("password2")).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifySent);

        let registry = h.auth.sessions().registry().await;
        let pending = &registry.pending[&session.id()];
        assert_eq!(pending.code, first);
        assert_eq!(pending.username, "alicia");
        assert_eq!(pending.password.expose(), "password2");
        assert_eq!(pending.tries_remaining, 5);
    }

    #[tokio::test]
    async fn test_email_checked_before_username() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;
        let (session, mut rx) = connect(&h).await;

        h.auth.register(&session, "A@B.com", "ALICE", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailAlreadyTaken);

        h.auth.register(&session, "c@d.com", "Alice", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::UsernameAlreadyTaken);

        assert_eq!(h.auth.sessions().pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let h = harness();
        let (session, mut rx) = connect(&h).await;

        h.auth.register(&session, "a@b.com", "alice", &pw("1234567")).await;
        assert_eq!(
            next(&mut rx),
            ServerMessage::RegistrationRejected(RegistrationRejection::PasswordTooShort)
        );
        assert_eq!(h.auth.sessions().pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_verify_exhausts_tries() {
        let h = harness();
        let (mut session, mut rx) = connect(&h).await;

        h.auth.register(&session, "a@b.com", "alice", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifySent);
        let code = pending_code(&h, session.id()).await;

        for expected in [4, 3, 2, 1, 0] {
            h.auth.verify_email(&mut session, "WRONG!").await;
            assert_eq!(next(&mut rx), ServerMessage::EmailVerifyFail { tries_remaining: expected });
        }
        assert_eq!(h.auth.sessions().pending_count().await, 0);

        h.auth.verify_email(&mut session, &code).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(h.auth.sessions().account_count().await, 0);
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_verify_success_creates_account_and_logs_in() {
        let h = harness();
        let (mut watcher, mut watcher_rx) = connect(&h).await;
        create_account(&h, "w@w.com", "watcher").await;
        h.auth.login(&mut watcher, "watcher", &pw("password1")).await;
        assert_eq!(next(&mut watcher_rx), ServerMessage::LoginSuccess);

        let (mut session, mut rx) = connect(&h).await;
        h.auth.register(&session, "a@b.com", "alice", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifySent);

        h.auth.verify_email(&mut session, "WRONG!").await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifyFail { tries_remaining: 4 });

        let code = pending_code(&h, session.id()).await.to_lowercase();
        h.auth.verify_email(&mut session, &code).await;
        assert_eq!(next(&mut rx), ServerMessage::EmailVerifySuccess);
        assert!(rx.try_recv().is_err());

        assert!(session.is_logged_in());
        assert_eq!(h.auth.sessions().account_count().await, 2);
        assert_eq!(h.auth.sessions().pending_count().await, 0);
        assert!(h.auth.sessions().is_online(session.id()).await);

        match next(&mut watcher_rx) {
            ServerMessage::PlayerConnected(summary) => {
                assert_eq!(summary.session, session.id());
                assert_eq!(summary.name, "alice's character");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_login_failures_are_generic() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;
        let (mut session, mut rx) = connect(&h).await;

        h.auth.login(&mut session, "nobody", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::LoginFail);

        h.auth.login(&mut session, "alice", &pw("password2")).await;
        assert_eq!(next(&mut rx), ServerMessage::LoginFail);

        assert!(!session.is_logged_in());
        assert_eq!(h.auth.sessions().online_count().await, 0);
    }

    #[tokio::test]
    async fn test_login_by_email_or_username() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;

        let (mut by_name, mut rx) = connect(&h).await;
        h.auth.login(&mut by_name, "ALICE", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::LoginSuccess);
        h.auth.logout(&mut by_name).await;

        let (mut by_email, mut rx) = connect(&h).await;
        h.auth.login(&mut by_email, "a@b.com", &pw("password1")).await;
        assert_eq!(next(&mut rx), ServerMessage::LoginSuccess);
    }

    #[tokio::test]
    async fn test_account_online_once() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;

        let (mut first, mut first_rx) = connect(&h).await;
        h.auth.login(&mut first, "alice", &pw("password1")).await;
        assert_eq!(next(&mut first_rx), ServerMessage::LoginSuccess);

        let (mut second, mut second_rx) = connect(&h).await;
        h.auth.login(&mut second, "alice", &pw("password1")).await;
        assert_eq!(next(&mut second_rx), ServerMessage::LoginFail);
        assert_eq!(h.auth.sessions().online_count().await, 1);
    }

    #[tokio::test]
    async fn test_roster_and_logout() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;
        create_account(&h, "b@b.com", "bob").await;

        let (mut alice, mut alice_rx) = connect(&h).await;
        let (mut bob, mut bob_rx) = connect(&h).await;

        h.auth.login(&mut alice, "alice", &pw("password1")).await;
        assert_eq!(next(&mut alice_rx), ServerMessage::LoginSuccess);
        h.auth.post_login(&alice).await;
        assert!(alice_rx.try_recv().is_err());

        h.auth.login(&mut bob, "bob", &pw("password1")).await;
        assert_eq!(next(&mut bob_rx), ServerMessage::LoginSuccess);
        assert!(matches!(next(&mut alice_rx), ServerMessage::PlayerConnected(s) if s.session == bob.id()));

        h.auth.post_login(&bob).await;
        h.auth.post_login(&bob).await;
        for _ in 0..2 {
            assert!(matches!(next(&mut bob_rx), ServerMessage::PlayerConnected(s) if s.session == alice.id()));
        }
        assert!(alice_rx.try_recv().is_err());

        h.auth.logout(&mut bob).await;
        assert!(!bob.is_logged_in());
        assert_eq!(next(&mut alice_rx), ServerMessage::PlayerDisconnected(bob.id()));
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(h.auth.sessions().online_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_state() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;
        create_account(&h, "b@b.com", "bob").await;

        let (mut alice, mut alice_rx) = connect(&h).await;
        let (mut bob, _bob_rx) = connect(&h).await;
        h.auth.login(&mut alice, "alice", &pw("password1")).await;
        h.auth.login(&mut bob, "bob", &pw("password1")).await;
        next(&mut alice_rx);
        next(&mut alice_rx);

        h.auth.disconnect(&mut bob).await;
        assert_eq!(next(&mut alice_rx), ServerMessage::PlayerDisconnected(bob.id()));
        assert_eq!(h.auth.sessions().connection_count().await, 1);
        assert_eq!(h.auth.sessions().online_count().await, 1);
    }

    #[tokio::test]
    async fn test_login_with_full_queue_leaves_registry_free() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;
        let (mut session, mut rx) = connect_with_queue(&h, 1).await;
        fill(&session);

        let auth = h.auth.clone();
        let login = tokio::spawn(async move {
            auth.login(&mut session, "alice", &pw("password1")).await;
            session
        });

        let online = tokio::time::timeout(Duration::from_secs(2), h.auth.sessions().online_count()).await;
        assert_eq!(online.ok(), Some(0));

        // Room frees up: the login finishes and its reply follows the backlog.
        assert!(matches!(rx.recv().await, Some(Outbound::Packet(p)) if p.key() == "MovementJump"));
        let session = login.await.unwrap();
        assert!(session.is_logged_in());
        assert_eq!(next(&mut rx), ServerMessage::LoginSuccess);
    }

    #[tokio::test]
    async fn test_stalled_peer_is_evicted_not_awaited() {
        let h = harness();
        create_account(&h, "a@b.com", "alice").await;
        create_account(&h, "b@b.com", "bob").await;
        create_account(&h, "c@b.com", "carol").await;

        let (mut bob, mut bob_rx) = connect_with_queue(&h, 2).await;
        h.auth.login(&mut bob, "bob", &pw("password1")).await;
        assert_eq!(next(&mut bob_rx), ServerMessage::LoginSuccess);
        fill(&bob);

        let (mut carol, mut carol_rx) = connect(&h).await;
        h.auth.login(&mut carol, "carol", &pw("password1")).await;
        assert_eq!(next(&mut carol_rx), ServerMessage::LoginSuccess);

        let (mut alice, mut alice_rx) = connect(&h).await;
        let alice_pw = pw("password1");
        let login = h.auth.login(&mut alice, "alice", &alice_pw);
        tokio::time::timeout(Duration::from_secs(2), login).await.unwrap();
        assert_eq!(next(&mut alice_rx), ServerMessage::LoginSuccess);

        assert!(bob.handle().eviction().is_evicted());
        assert!(matches!(next(&mut carol_rx), ServerMessage::PlayerConnected(s) if s.session == alice.id()));

        let logout = h.auth.logout(&mut alice);
        tokio::time::timeout(Duration::from_secs(2), logout).await.unwrap();
        assert_eq!(next(&mut carol_rx), ServerMessage::PlayerDisconnected(alice.id()));
    }
}
