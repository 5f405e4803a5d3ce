//! Session Management
//!
//! [`Session`] is the per-connection state owned by the connection task.
//! [`SessionManager`] holds everything shared between connections behind a
//! single lock: the connection registry, the online directory, pending
//! registrations and the account directory.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tracing::warn;

use crate::core::crypto::SymmetricKey;
use crate::core::packet::Packet;
use crate::network::auth::PendingRegistration;
use crate::network::handshake::ServerHandshake;
use crate::network::protocol::{CharacterSummary, ServerMessage};
use crate::storage::accounts::{Account, AccountDirectory, AccountId};

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(i32);

impl SessionId {
    /// Wrap a raw id.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Raw id, as carried on the wire.
    pub fn get(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic session id source, starting at 0.
///
/// Ids are never reused: once the wire range is spent, no more are issued.
#[derive(Debug, Default)]
pub struct SessionIdAllocator {
    next: AtomicI32,
}

impl SessionIdAllocator {
    /// Allocator whose first id is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first id is `first`.
    pub fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicI32::new(first),
        }
    }

    /// Next id, or `None` once the id space is exhausted.
    pub fn next_id(&self) -> Option<SessionId> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .ok()
            .map(SessionId)
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Unit of work for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-built handshake body, written without the symmetric layer.
    Handshake(Bytes),
    /// Application packet, sealed with the session key by the writer.
    Packet(Packet),
}

/// Server-side request to close one connection.
///
/// Shared between every handle of a session and its connection task. Holds
/// no sender, so waiting on it never keeps the writer alive.
#[derive(Debug, Clone, Default)]
pub struct EvictionSignal {
    inner: Arc<EvictionState>,
}

#[derive(Debug, Default)]
struct EvictionState {
    evicted: AtomicBool,
    notify: Notify,
}

impl EvictionSignal {
    /// Ask the connection task to close.
    pub fn evict(&self) {
        if !self.inner.evicted.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_one();
        }
    }

    /// True once eviction was requested.
    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    /// Resolves once eviction was requested.
    pub async fn evicted(&self) {
        while !self.is_evicted() {
            self.inner.notify.notified().await;
        }
    }
}

/// One reserved slot in a connection's outbound queue.
///
/// Filling it never waits, so it may be used while holding the registry lock.
#[derive(Debug)]
pub struct Reply<'a> {
    permit: mpsc::Permit<'a, Outbound>,
}

impl Reply<'_> {
    /// Fill the slot.
    pub fn send(self, message: ServerMessage) {
        self.permit.send(Outbound::Packet(message.to_packet()));
    }
}

/// Cloneable sending side of one connection.
///
/// Everything written to a connection goes through this queue, so the single
/// writer task keeps frames whole and in program order.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    eviction: EvictionSignal,
}

impl SessionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(id: SessionId, addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            addr,
            tx,
            eviction: EvictionSignal::default(),
        };
        (handle, rx)
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a server message, waiting for room. False if the writer is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.send_packet(message.to_packet()).await
    }

    /// Queue a packet, waiting for room. False if the writer is gone.
    pub async fn send_packet(&self, packet: Packet) -> bool {
        self.tx.send(Outbound::Packet(packet)).await.is_ok()
    }

    /// Queue a handshake body.
    pub async fn send_handshake(&self, body: Vec<u8>) -> bool {
        self.tx.send(Outbound::Handshake(Bytes::from(body))).await.is_ok()
    }

    /// Queue a packet without waiting. False if the queue is full or closed.
    pub fn try_send_packet(&self, packet: Packet) -> bool {
        match self.tx.try_send(Outbound::Packet(packet)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Reserve room for one message. `None` if the writer is gone.
    pub async fn reserve(&self) -> Option<Reply<'_>> {
        self.tx.reserve().await.ok().map(|permit| Reply { permit })
    }

    /// Queue a server message without waiting. A full queue means the peer
    /// stopped reading: the session is evicted instead of blocking the caller.
    pub fn send_or_evict(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(Outbound::Packet(message.to_packet())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.id, addr = %self.addr, "Outbound queue full, evicting session");
                self.eviction.evict();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Eviction signal shared with the connection task.
    pub fn eviction(&self) -> EvictionSignal {
        self.eviction.clone()
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Per-connection state.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    handshake: ServerHandshake,
    account: Option<Account>,
}

impl Session {
    /// New session with a fresh symmetric key.
    pub fn new(handle: SessionHandle) -> Self {
        Self::with_handshake(handle, ServerHandshake::new())
    }

    /// New session with a prepared handshake.
    pub fn with_handshake(handle: SessionHandle, handshake: ServerHandshake) -> Self {
        Self {
            handle,
            handshake,
            account: None,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Peer address.
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    /// Outbound handle.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Handshake state.
    pub fn handshake(&self) -> &ServerHandshake {
        &self.handshake
    }

    /// Mutable handshake state.
    pub fn handshake_mut(&mut self) -> &mut ServerHandshake {
        &mut self.handshake
    }

    /// Session key.
    pub fn key(&self) -> &SymmetricKey {
        self.handshake.key()
    }

    /// True once the peer confirmed the key.
    pub fn is_secure(&self) -> bool {
        self.handshake.is_secure()
    }

    /// True when logged in.
    pub fn is_logged_in(&self) -> bool {
        self.account.is_some()
    }

    /// Logged-in account.
    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    /// Record a successful login.
    pub fn log_in(&mut self, account: Account) {
        self.account = Some(account);
    }

    /// Clear the login, returning the account.
    pub fn log_out(&mut self) -> Option<Account> {
        self.account.take()
    }

    /// Send a server message on this session.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.handle.send(message).await
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// A logged-in session.
#[derive(Debug, Clone)]
pub struct OnlineEntry {
    /// Outbound handle.
    pub handle: SessionHandle,
    /// Public character data.
    pub summary: CharacterSummary,
}

/// Shared state guarded by the manager's lock.
#[derive(Debug)]
pub struct Registry {
    /// Every open connection.
    pub connections: BTreeMap<SessionId, SessionHandle>,
    /// Logged-in sessions.
    pub online: BTreeMap<SessionId, OnlineEntry>,
    /// Registrations awaiting a verification code.
    pub pending: BTreeMap<SessionId, PendingRegistration>,
    /// Persisted accounts.
    pub accounts: AccountDirectory,
}

impl Registry {
    /// True when `account` is logged in on any session.
    pub fn is_account_online(&self, account: AccountId) -> bool {
        self.online.values().any(|entry| entry.summary.account == account)
    }

    /// Handles of online sessions other than `except`.
    pub fn online_except(&self, except: SessionId) -> Vec<SessionHandle> {
        self.online
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(_, entry)| entry.handle.clone())
            .collect()
    }
}

/// Owner of all cross-connection state.
#[derive(Debug)]
pub struct SessionManager {
    ids: SessionIdAllocator,
    registry: Mutex<Registry>,
}

impl SessionManager {
    /// Create a manager over an opened account directory.
    pub fn new(accounts: AccountDirectory) -> Self {
        Self {
            ids: SessionIdAllocator::new(),
            registry: Mutex::new(Registry {
                connections: BTreeMap::new(),
                online: BTreeMap::new(),
                pending: BTreeMap::new(),
                accounts,
            }),
        }
    }

    /// Allocate the next session id. `None` once ids are exhausted.
    pub fn next_id(&self) -> Option<SessionId> {
        self.ids.next_id()
    }

    /// Lock the shared state.
    pub async fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    /// Add a connection.
    pub async fn register(&self, handle: SessionHandle) {
        self.registry().await.connections.insert(handle.id, handle);
    }

    /// Drop every trace of a connection. Returns its online entry if it
    /// was logged in.
    pub async fn unregister(&self, id: SessionId) -> Option<OnlineEntry> {
        let mut registry = self.registry().await;
        registry.connections.remove(&id);
        registry.pending.remove(&id);
        registry.online.remove(&id)
    }

    /// Handles of online sessions other than `except`.
    pub async fn online_except(&self, except: SessionId) -> Vec<SessionHandle> {
        self.registry().await.online_except(except)
    }

    /// Summaries of online sessions other than `except`.
    pub async fn roster_except(&self, except: SessionId) -> Vec<CharacterSummary> {
        self.registry()
            .await
            .online
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(_, entry)| entry.summary.clone())
            .collect()
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.registry().await.connections.len()
    }

    /// Logged-in sessions.
    pub async fn online_count(&self) -> usize {
        self.registry().await.online.len()
    }

    /// Pending registrations.
    pub async fn pending_count(&self) -> usize {
        self.registry().await.pending.len()
    }

    /// Registered accounts.
    pub async fn account_count(&self) -> usize {
        self.registry().await.accounts.len()
    }

    /// True when `id` is in the online directory.
    pub async fn is_online(&self, id: SessionId) -> bool {
        self.registry().await.online.contains_key(&id)
    }
}
