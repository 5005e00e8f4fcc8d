//! Room aggregate: owns a room's membership, rules, and lifecycle.

pub mod repo;

use std::{collections::HashSet, sync::Arc};

use broker_protocol::{PeerId, RoomId, RoomRules};
use chrono::{DateTime, Utc};
use failure::Fail;

use crate::events::{DomainEvent, SeqGen};

/// Errors raised by [`Room`] operations. Each is a *state* or *validation*
/// error per the broker's error taxonomy: callers surface it verbatim and
/// never retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Fail)]
pub enum RoomError {
    #[fail(display = "room is not active")]
    RoomInactive,

    #[fail(display = "room is full")]
    RoomFull,

    #[fail(display = "peer is already a member of this room")]
    AlreadyJoined,

    #[fail(display = "peer is not a member of this room")]
    NotAMember,

    #[fail(display = "room is already closed")]
    AlreadyClosed,

    #[fail(display = "invalid room rules")]
    InvalidRoomRules,
}

impl RoomRules {
    /// Validates the invariants from §3: `maxPlayers >= 1`,
    /// `opusBitrate >= 0` (trivially true for `u32`).
    fn validate(&self) -> Result<(), RoomError> {
        if self.max_players == 0 {
            return Err(RoomError::InvalidRoomRules);
        }
        Ok(())
    }
}

/// A named grouping of peers sharing signaling and broadcast scope.
///
/// Membership invariants live here so the gateway cannot create ambiguous
/// states by racing two `join`s — callers are expected to serialize
/// mutations of one room through the repository's per-aggregate
/// transaction boundary (see [`repo::RoomRepository`]).
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    owner_id: PeerId,
    rules: RoomRules,
    members: HashSet<PeerId>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
    seq: Arc<SeqGen>,
}

impl Room {
    /// Creates a new room with `owner_id` as its sole member.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::InvalidRoomRules`] if `rules` violates an
    /// invariant.
    pub fn create(
        id: RoomId,
        owner_id: PeerId,
        rules: RoomRules,
        seq: Arc<SeqGen>,
    ) -> Result<Self, RoomError> {
        rules.validate()?;

        let now = Utc::now();
        let mut members = HashSet::with_capacity(1);
        members.insert(owner_id.clone());

        let mut room = Self {
            id: id.clone(),
            owner_id: owner_id.clone(),
            rules,
            members,
            active: true,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            seq,
        };
        room.events.push(DomainEvent::RoomCreated {
            seq: room.seq.next(),
            room_id: id,
            owner_id,
            rules,
        });
        Ok(room)
    }

    /// Reconstructs a [`Room`] from persisted state, without emitting
    /// creation events. Used by repository implementations.
    #[must_use]
    pub fn hydrate(
        id: RoomId,
        owner_id: PeerId,
        rules: RoomRules,
        members: HashSet<PeerId>,
        active: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        seq: Arc<SeqGen>,
    ) -> Self {
        Self {
            id,
            owner_id,
            rules,
            members,
            active,
            created_at,
            updated_at,
            events: Vec::new(),
            seq,
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn owner_id(&self) -> &PeerId {
        &self.owner_id
    }

    #[must_use]
    pub fn rules(&self) -> &RoomRules {
        &self.rules
    }

    #[must_use]
    pub fn members(&self) -> &HashSet<PeerId> {
        &self.members
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    #[must_use]
    pub fn is_owner(&self, peer: &PeerId) -> bool {
        &self.owner_id == peer
    }

    #[must_use]
    pub fn has_player(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Admits `peer` to the room.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomInactive`], [`RoomError::RoomFull`],
    /// [`RoomError::AlreadyJoined`].
    pub fn join(&mut self, peer: PeerId) -> Result<(), RoomError> {
        if !self.active {
            return Err(RoomError::RoomInactive);
        }
        if self.members.len() as u32 == self.rules.max_players {
            return Err(RoomError::RoomFull);
        }
        if self.members.contains(&peer) {
            return Err(RoomError::AlreadyJoined);
        }

        self.members.insert(peer.clone());
        self.touch();
        self.events.push(DomainEvent::PlayerJoined {
            seq: self.seq.next(),
            room_id: self.id.clone(),
            peer_id: peer,
        });
        Ok(())
    }

    /// Removes `peer` from the room. If this empties the room, the room
    /// transitions to closed in the same call and both `player-left` and
    /// `room-closed` are emitted, in that order.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotAMember`].
    pub fn leave(&mut self, peer: &PeerId) -> Result<(), RoomError> {
        if !self.members.remove(peer) {
            return Err(RoomError::NotAMember);
        }

        self.touch();
        self.events.push(DomainEvent::PlayerLeft {
            seq: self.seq.next(),
            room_id: self.id.clone(),
            peer_id: peer.clone(),
        });

        if self.members.is_empty() {
            self.active = false;
            self.events.push(DomainEvent::RoomClosed {
                seq: self.seq.next(),
                room_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Replaces the room's rules. Member count exceeding the new
    /// `maxPlayers` is not retroactively enforced — only future `join`s are
    /// restricted.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomInactive`], [`RoomError::InvalidRoomRules`].
    pub fn update_rules(&mut self, rules: RoomRules) -> Result<(), RoomError> {
        if !self.active {
            return Err(RoomError::RoomInactive);
        }
        rules.validate()?;

        self.rules = rules;
        self.touch();
        self.events.push(DomainEvent::RoomRuleChanged {
            seq: self.seq.next(),
            room_id: self.id.clone(),
            rules,
        });
        Ok(())
    }

    /// Closes the room unconditionally.
    ///
    /// # Errors
    ///
    /// [`RoomError::AlreadyClosed`].
    pub fn close(&mut self) -> Result<(), RoomError> {
        if !self.active {
            return Err(RoomError::AlreadyClosed);
        }
        self.active = false;
        self.touch();
        self.events.push(DomainEvent::RoomClosed {
            seq: self.seq.next(),
            room_id: self.id.clone(),
        });
        Ok(())
    }

    /// Drains and returns every [`DomainEvent`] emitted since the last call.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(max_players: u32) -> RoomRules {
        RoomRules {
            max_players,
            allow_relay: true,
            latency_target_ms: 100,
            opus_bitrate: 64_000,
        }
    }

    fn room(max_players: u32) -> Room {
        Room::create(
            RoomId("R".into()),
            PeerId("owner".into()),
            rules(max_players),
            Arc::new(SeqGen::default()),
        )
        .unwrap()
    }

    #[test]
    fn create_makes_owner_sole_member() {
        let mut r = room(4);
        assert!(r.has_player(&PeerId("owner".into())));
        assert_eq!(r.members().len(), 1);
        assert!(r.is_active());
        let events = r.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "room-created");
    }

    #[test]
    fn join_enforces_capacity() {
        let mut r = room(2);
        r.take_events();
        r.join(PeerId("b".into())).unwrap();
        assert_eq!(
            r.join(PeerId("c".into())),
            Err(RoomError::RoomFull)
        );
        assert_eq!(r.members().len(), 2);
    }

    #[test]
    fn join_rejects_duplicate_member() {
        let mut r = room(4);
        assert_eq!(
            r.join(PeerId("owner".into())),
            Err(RoomError::AlreadyJoined)
        );
    }

    #[test]
    fn join_rejects_inactive_room() {
        let mut r = room(4);
        r.leave(&PeerId("owner".into())).unwrap();
        assert_eq!(
            r.join(PeerId("new".into())),
            Err(RoomError::RoomInactive)
        );
    }

    #[test]
    fn leave_unknown_member_fails() {
        let mut r = room(4);
        assert_eq!(
            r.leave(&PeerId("ghost".into())),
            Err(RoomError::NotAMember)
        );
    }

    #[test]
    fn last_leave_auto_closes_and_orders_events() {
        let mut r = room(4);
        r.take_events();
        r.leave(&PeerId("owner".into())).unwrap();
        assert!(!r.is_active());
        let events = r.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "player-left");
        assert_eq!(events[1].name(), "room-closed");
    }

    #[test]
    fn update_rules_does_not_retroactively_evict() {
        let mut r = room(4);
        r.join(PeerId("b".into())).unwrap();
        r.join(PeerId("c".into())).unwrap();
        r.update_rules(rules(1)).unwrap();
        assert_eq!(r.members().len(), 3);
        assert_eq!(
            r.join(PeerId("d".into())),
            Err(RoomError::RoomFull)
        );
    }

    #[test]
    fn close_twice_fails() {
        let mut r = room(4);
        r.close().unwrap();
        assert_eq!(r.close(), Err(RoomError::AlreadyClosed));
    }

    #[test]
    fn invalid_rules_rejected_on_create() {
        let err = Room::create(
            RoomId("R".into()),
            PeerId("owner".into()),
            rules(0),
            Arc::new(SeqGen::default()),
        )
        .unwrap_err();
        assert_eq!(err, RoomError::InvalidRoomRules);
    }
}
