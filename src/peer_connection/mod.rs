//! Peer-connection aggregate: a directed pairwise signaling state.

pub mod repo;

use std::sync::Arc;

use broker_protocol::{ConnectionState, PeerId, RoomId};
use chrono::{DateTime, Duration, Utc};
use derive_more::Display;

use crate::events::{DomainEvent, SeqGen};

/// A connection is stale enough to warrant a `connection-timeout` event if
/// the last `connected` observation is older than this when the pair falls
/// into `failed`/`disconnected`.
const CONNECTED_STALENESS: Duration = Duration::milliseconds(30_000);

/// Composite identity of a directed pairwise connection. `(A, B)` and
/// `(B, A)` are distinct keys by design — see the gateway's directional
/// lookups.
#[derive(Clone, Debug, Display, Eq, PartialEq, Hash)]
#[display(fmt = "{}->{}", local, remote)]
pub struct ConnectionId {
    pub local: PeerId,
    pub remote: PeerId,
}

impl ConnectionId {
    #[must_use]
    pub fn new(local: PeerId, remote: PeerId) -> Self {
        Self { local, remote }
    }

    /// The reverse-direction key for the same pair of peers.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

/// A directed pairwise signaling state between two peers in one room.
#[derive(Debug)]
pub struct PeerConnection {
    id: ConnectionId,
    room_id: RoomId,
    state: ConnectionState,
    last_connected_at: Option<DateTime<Utc>>,
    ice_candidates_count: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
    seq: Arc<SeqGen>,
}

impl PeerConnection {
    /// Lazily created by the signal service on the first signaling message
    /// observed for a pair.
    #[must_use]
    pub fn create(
        room_id: RoomId,
        local: PeerId,
        remote: PeerId,
        seq: Arc<SeqGen>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(local, remote),
            room_id,
            state: ConnectionState::New,
            last_connected_at: None,
            ice_candidates_count: 0,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            seq,
        }
    }

    /// Reconstructs a [`PeerConnection`] from persisted state.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn hydrate(
        id: ConnectionId,
        room_id: RoomId,
        state: ConnectionState,
        last_connected_at: Option<DateTime<Utc>>,
        ice_candidates_count: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        seq: Arc<SeqGen>,
    ) -> Self {
        Self {
            id,
            room_id,
            state,
            last_connected_at,
            ice_candidates_count,
            created_at,
            updated_at,
            events: Vec::new(),
            seq,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.last_connected_at
    }

    #[must_use]
    pub fn ice_candidates_count(&self) -> u64 {
        self.ice_candidates_count
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Transitions to `state`. A no-op transition (new state equals current)
    /// emits nothing and leaves `updated_at` untouched. Transitions into
    /// `failed`/`disconnected` with a stale last-`connected` observation
    /// also emit `connection-timeout`.
    pub fn update_connection_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }

        let previous = self.state;
        self.state = state;
        self.updated_at = Utc::now();

        if state == ConnectionState::Connected {
            self.last_connected_at = Some(self.updated_at);
        }

        self.events.push(DomainEvent::ConnectionStateChanged {
            seq: self.seq.next(),
            room_id: self.room_id.clone(),
            peer_id: self.id.local.clone(),
            state,
            previous_state: previous,
        });

        let transitioning_to_unhealthy = matches!(
            state,
            ConnectionState::Failed | ConnectionState::Disconnected
        );
        if transitioning_to_unhealthy {
            if let Some(last_connected) = self.last_connected_at {
                if self.updated_at - last_connected > CONNECTED_STALENESS {
                    self.events.push(DomainEvent::ConnectionTimeout {
                        seq: self.seq.next(),
                        room_id: self.room_id.clone(),
                        peer_id: self.id.local.clone(),
                        timeout_ms: CONNECTED_STALENESS.num_milliseconds() as u64,
                    });
                }
            }
        }
    }

    /// Records an observed ICE candidate. Does not alter connection state.
    pub fn handle_ice_candidate(&mut self) {
        self.ice_candidates_count += 1;
        self.updated_at = Utc::now();
        self.events.push(DomainEvent::IceCandidateReceived {
            seq: self.seq.next(),
            room_id: self.room_id.clone(),
            from: self.id.local.clone(),
            to: self.id.remote.clone(),
        });
    }

    /// Forces state to `connecting` and emits `offer-received`.
    pub fn handle_offer(&mut self) {
        self.update_connection_state(ConnectionState::Connecting);
        self.events.push(DomainEvent::OfferReceived {
            seq: self.seq.next(),
            room_id: self.room_id.clone(),
            from: self.id.local.clone(),
            to: self.id.remote.clone(),
        });
    }

    /// Forces state to `connected` and emits `answer-received`.
    pub fn handle_answer(&mut self) {
        self.update_connection_state(ConnectionState::Connected);
        self.events.push(DomainEvent::AnswerReceived {
            seq: self.seq.next(),
            room_id: self.room_id.clone(),
            from: self.id.local.clone(),
            to: self.id.remote.clone(),
        });
    }

    /// Drains and returns every [`DomainEvent`] emitted since the last call.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }
}
