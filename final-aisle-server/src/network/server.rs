//! TCP Relay Server
//!
//! One task per connection reads frames and drives the [`Dispatcher`]. A
//! second task per connection owns the write half and drains the session's
//! outbound queue, so frames for one peer are written whole and in order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::core::codec::{seal_packet, FrameCodec, FrameError, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX};
use crate::core::crypto::SymmetricKey;
use crate::network::auth::{AuthConfig, AuthService};
use crate::network::dispatcher::Dispatcher;
use crate::network::env_or;
use crate::network::handshake::HandshakeError;
use crate::network::mail::Mailer;
use crate::network::relay::{AcceptAll, MovementValidator, Relay};
use crate::network::session::{Outbound, Session, SessionHandle, SessionId, SessionManager};
use crate::storage::accounts::AccountDirectory;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 8031;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum frame body size.
    pub max_frame_size: usize,
    /// Outbound queue depth per connection.
    pub outbound_queue: usize,
    /// Traffic report period, `None` disables.
    pub stats_interval: Option<Duration>,
    /// How long shutdown waits for connections to close.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue: 256,
            stats_interval: Some(Duration::from_secs(10)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let stats_secs = env_or(
            "FINAL_AISLE_STATS_INTERVAL_SECS",
            defaults.stats_interval.map_or(0, |d| d.as_secs()),
        );

        Self {
            bind_addr: env_or("FINAL_AISLE_BIND", defaults.bind_addr),
            max_connections: env_or("FINAL_AISLE_MAX_CONNECTIONS", defaults.max_connections),
            max_frame_size: env_or("FINAL_AISLE_MAX_FRAME_SIZE", defaults.max_frame_size),
            outbound_queue: env_or("FINAL_AISLE_OUTBOUND_QUEUE", defaults.outbound_queue),
            stats_interval: (stats_secs > 0).then(|| Duration::from_secs(stats_secs)),
            shutdown_grace: Duration::from_secs(env_or(
                "FINAL_AISLE_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Listener or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unreadable frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Handshake failed.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

// =============================================================================
// TRAFFIC STATS
// =============================================================================

/// Aggregate byte counters, including length prefixes.
#[derive(Debug, Default)]
pub struct TrafficStats {
    sent: AtomicU64,
    received: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Bytes written.
    pub sent: u64,
    /// Bytes read.
    pub received: u64,
}

impl TrafficStats {
    /// Count bytes written.
    pub fn add_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count bytes read.
    pub fn add_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Current totals.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<TrafficStats>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a server that relays every movement event.
    pub fn new(
        config: ServerConfig,
        auth_config: AuthConfig,
        accounts: AccountDirectory,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self::with_validator(config, auth_config, accounts, mailer, Arc::new(AcceptAll))
    }

    /// Create a server with a movement validator.
    pub fn with_validator(
        config: ServerConfig,
        auth_config: AuthConfig,
        accounts: AccountDirectory,
        mailer: Arc<dyn Mailer>,
        validator: Arc<dyn MovementValidator>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(accounts));
        let auth = AuthService::new(auth_config, sessions.clone(), mailer);
        let relay = Relay::with_validator(sessions.clone(), validator);
        let dispatcher = Arc::new(Dispatcher::new(auth, relay, config.max_frame_size));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            sessions,
            dispatcher,
            stats: Arc::new(TrafficStats::default()),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Relay server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();
        let reporter = self.config.stats_interval.map(|period| {
            tokio::spawn(report_stats(self.stats.clone(), self.sessions.clone(), period))
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if tasks.len() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            tasks.spawn(handle_connection(stream, addr, self.connection_context()));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(joined);
                }
                _ = shutdown_signal(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        let drained = timeout(self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                reap(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Shutdown grace expired, aborting connections");
            tasks.abort_all();
        }

        info!("Relay server stopped");
        Ok(())
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            dispatcher: self.dispatcher.clone(),
            stats: self.stats.clone(),
            max_frame_size: self.config.max_frame_size,
            outbound_queue: self.config.outbound_queue,
            shutdown_grace: self.config.shutdown_grace,
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Stop accepting, close every connection and return from `serve`.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared session state.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Traffic counters.
    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.sessions.connection_count().await
    }

    /// Logged-in sessions.
    pub async fn online_count(&self) -> usize {
        self.sessions.online_count().await
    }

    /// Registered accounts.
    pub async fn account_count(&self) -> usize {
        self.sessions.account_count().await
    }
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        }
    }
}

// =============================================================================
// CONNECTION TASKS
// =============================================================================

struct ConnectionContext {
    dispatcher: Arc<Dispatcher>,
    stats: Arc<TrafficStats>,
    max_frame_size: usize,
    outbound_queue: usize,
    shutdown_grace: Duration,
    shutdown: watch::Receiver<bool>,
}

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Bytes>;

async fn handle_connection(stream: TcpStream, addr: SocketAddr, mut ctx: ConnectionContext) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let sessions = ctx.dispatcher.auth().sessions().clone();
    let Some(id) = sessions.next_id() else {
        error!("Session ids exhausted, refusing {}", addr);
        return;
    };
    let (handle, rx) = SessionHandle::channel(id, addr, ctx.outbound_queue);
    let eviction = handle.eviction();
    let mut session = Session::new(handle.clone());
    sessions.register(handle).await;

    let (sink, mut frames) = Framed::new(stream, FrameCodec::new(ctx.max_frame_size)).split();
    let mut writer = tokio::spawn(write_loop(sink, rx, session.key().clone(), ctx.stats.clone(), id));
    info!(session = %id, %addr, "Session opened");

    loop {
        tokio::select! {
            frame = frames.next() => {
                match frame {
                    Some(Ok(body)) => {
                        ctx.stats.add_received(LENGTH_PREFIX + body.len());
                        if let Err(e) = ctx.dispatcher.handle_frame(&mut session, &body).await {
                            warn!(session = %id, %addr, error = %e, "Closing connection");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session = %id, %addr, error = %e, "Unreadable frame, closing connection");
                        break;
                    }
                    None => {
                        debug!(session = %id, "Peer closed connection");
                        break;
                    }
                }
            }
            _ = eviction.evicted() => {
                warn!(session = %id, %addr, "Peer is not reading, closing connection");
                break;
            }
            _ = shutdown_signal(&mut ctx.shutdown) => {
                debug!(session = %id, "Closing for shutdown");
                break;
            }
        }
    }

    ctx.dispatcher.auth().disconnect(&mut session).await;
    drop(session);

    if timeout(ctx.shutdown_grace, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(session = %id, %addr, "Session closed");
}

/// Drain the outbound queue onto the socket until every sender is gone.
async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Outbound>,
    key: SymmetricKey,
    stats: Arc<TrafficStats>,
    id: SessionId,
) {
    while let Some(outbound) = rx.recv().await {
        let body = match outbound {
            Outbound::Handshake(body) => body,
            Outbound::Packet(packet) => match seal_packet(&packet, &key) {
                Ok(sealed) => Bytes::from(sealed),
                Err(e) => {
                    error!(session = %id, key = packet.key(), error = %e, "Failed to seal packet");
                    continue;
                }
            },
        };

        let len = body.len();
        if let Err(e) = sink.send(body).await {
            debug!(session = %id, error = %e, "Write failed");
            break;
        }
        stats.add_sent(LENGTH_PREFIX + len);
    }

    let _ = sink.close().await;
}

async fn report_stats(stats: Arc<TrafficStats>, sessions: Arc<SessionManager>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let seconds = period.as_secs_f64();
    let mut last = stats.snapshot();
    loop {
        ticker.tick().await;
        let now = stats.snapshot();
        let sent_rate = now.sent.saturating_sub(last.sent) as f64 / seconds;
        let received_rate = now.received.saturating_sub(last.received) as f64 / seconds;
        last = now;

        let connections = sessions.connection_count().await;
        let online = sessions.online_count().await;
        info!(
            connections,
            online,
            sent = now.sent,
            received = now.received,
            "Traffic: up {:.1} B/s, down {:.1} B/s",
            sent_rate,
            received_rate
        );
    }
}
