//! Movement relay.
//!
//! Forwards a logged-in sender's movement events to every other online
//! session, tagged with the sender's id. Delivery is best effort: a peer
//! whose queue is full misses the event rather than stalling the sender.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::network::protocol::RelayEvent;
use crate::network::session::{Session, SessionId, SessionManager};

/// Hook for server-side movement checks.
pub trait MovementValidator: Send + Sync {
    /// False drops the event.
    fn validate(&self, sender: SessionId, event: &RelayEvent) -> bool;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl MovementValidator for AcceptAll {
    fn validate(&self, _sender: SessionId, _event: &RelayEvent) -> bool {
        true
    }
}

/// Rejects non-finite coordinates and axes outside `[-1, 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FiniteMovement;

impl MovementValidator for FiniteMovement {
    fn validate(&self, _sender: SessionId, event: &RelayEvent) -> bool {
        match *event {
            RelayEvent::Position { x, y, z } => x.is_finite() && y.is_finite() && z.is_finite(),
            RelayEvent::Rotation(angle) => angle.is_finite(),
            RelayEvent::Input { x, y } => (-1.0..=1.0).contains(&x) && (-1.0..=1.0).contains(&y),
            RelayEvent::Roll(direction) => direction.is_finite(),
            RelayEvent::Jump | RelayEvent::ToggleProne(_) => true,
        }
    }
}

/// Fan-out of movement events.
#[derive(Clone)]
pub struct Relay {
    sessions: Arc<SessionManager>,
    validator: Arc<dyn MovementValidator>,
}

impl Relay {
    /// Relay that forwards everything.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self::with_validator(sessions, Arc::new(AcceptAll))
    }

    /// Relay with a custom validator.
    pub fn with_validator(sessions: Arc<SessionManager>, validator: Arc<dyn MovementValidator>) -> Self {
        Self {
            sessions,
            validator,
        }
    }

    /// Forward `event` from `sender`. Returns how many peers it was queued for.
    pub async fn forward(&self, sender: &Session, event: RelayEvent) -> usize {
        if !sender.is_logged_in() {
            return 0;
        }
        if !self.validator.validate(sender.id(), &event) {
            debug!(session = %sender.id(), ?event, "Movement rejected");
            return 0;
        }

        let packet = event.to_relay(sender.id());
        let peers = self.sessions.online_except(sender.id()).await;

        let mut delivered = 0;
        for peer in peers {
            if peer.try_send_packet(packet.clone()) {
                delivered += 1;
            } else {
                debug!(from = %sender.id(), to = %peer.id(), key = %event.key(), "Relay dropped, peer queue full");
            }
        }
        trace!(session = %sender.id(), key = %event.key(), delivered, "Relayed");
        delivered
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}
