//! Storage seam for [`Room`] aggregates.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use broker_protocol::{PeerId, RoomId};
use failure::Fail;
use tokio::sync::Mutex;

use super::Room;
use crate::events::SeqGen;

/// Errors raised while locating or persisting a [`Room`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Fail)]
pub enum RepoError {
    #[fail(display = "room not found")]
    NotFound,
}

/// Storage seam for [`Room`] aggregates.
///
/// The in-memory implementation below is what the broker ships with; a
/// durable backend (e.g. Redis, so multiple gateway processes can share
/// room state) plugs in at this trait without touching use-case code.
#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn insert(&self, room: Room);

    async fn get(&self, id: &RoomId) -> Result<Room, RepoError>;

    /// Runs `f` against the room identified by `id` and persists the result,
    /// returning whatever `f` returns. Used by use-cases that mutate a room
    /// and need its buffered events back out in one step.
    async fn mutate<F, T>(&self, id: &RoomId, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Room) -> T + Send;

    async fn remove(&self, id: &RoomId);

    async fn all_active(&self) -> Vec<RoomId>;

    /// Every room currently owned by `owner_id`.
    async fn find_by_owner_id(&self, owner_id: &PeerId) -> Vec<RoomId>;
}

/// `Mutex<HashMap<..>>`-backed implementation, sufficient for a single
/// broker process. Every room shares one [`SeqGen`] so cross-room event
/// ordering is well defined.
pub struct InMemoryRoomRepository {
    rooms: Mutex<HashMap<RoomId, Room>>,
    seq: Arc<SeqGen>,
}

impl InMemoryRoomRepository {
    #[must_use]
    pub fn new(seq: Arc<SeqGen>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            seq,
        }
    }

    #[must_use]
    pub fn seq(&self) -> Arc<SeqGen> {
        Arc::clone(&self.seq)
    }
}

#[async_trait]
impl RoomRepository for InMemoryRoomRepository {
    async fn insert(&self, room: Room) {
        self.rooms.lock().await.insert(room.id().clone(), room);
    }

    async fn get(&self, id: &RoomId) -> Result<Room, RepoError> {
        self.rooms
            .lock()
            .await
            .get(id)
            .map(|room| {
                Room::hydrate(
                    room.id().clone(),
                    room.owner_id().clone(),
                    *room.rules(),
                    room.members().clone(),
                    room.is_active(),
                    room.created_at(),
                    room.updated_at(),
                    Arc::clone(&self.seq),
                )
            })
            .ok_or(RepoError::NotFound)
    }

    async fn mutate<F, T>(&self, id: &RoomId, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Room) -> T + Send,
    {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.get_mut(id).ok_or(RepoError::NotFound)?;
        Ok(f(room))
    }

    async fn remove(&self, id: &RoomId) {
        self.rooms.lock().await.remove(id);
    }

    async fn all_active(&self) -> Vec<RoomId> {
        self.rooms
            .lock()
            .await
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.id().clone())
            .collect()
    }

    async fn find_by_owner_id(&self, owner_id: &PeerId) -> Vec<RoomId> {
        self.rooms
            .lock()
            .await
            .values()
            .filter(|r| r.is_owner(owner_id))
            .map(|r| r.id().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use broker_protocol::{PeerId, RoomRules};

    use super::*;

    fn rules() -> RoomRules {
        RoomRules {
            max_players: 4,
            allow_relay: true,
            latency_target_ms: 100,
            opus_bitrate: 64_000,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let repo = InMemoryRoomRepository::new(Arc::new(SeqGen::default()));
        let room = Room::create(
            RoomId("R".into()),
            PeerId("owner".into()),
            rules(),
            repo.seq(),
        )
        .unwrap();
        repo.insert(room).await;

        let fetched = repo.get(&RoomId("R".into())).await.unwrap();
        assert_eq!(fetched.id(), &RoomId("R".into()));
    }

    #[tokio::test]
    async fn get_missing_room_errors() {
        let repo = InMemoryRoomRepository::new(Arc::new(SeqGen::default()));
        assert_eq!(
            repo.get(&RoomId("ghost".into())).await.unwrap_err(),
            RepoError::NotFound
        );
    }

    #[tokio::test]
    async fn mutate_applies_in_place_and_returns_events() {
        let repo = InMemoryRoomRepository::new(Arc::new(SeqGen::default()));
        let room = Room::create(
            RoomId("R".into()),
            PeerId("owner".into()),
            rules(),
            repo.seq(),
        )
        .unwrap();
        repo.insert(room).await;

        let events = repo
            .mutate(&RoomId("R".into()), |room| {
                room.take_events();
                room.join(PeerId("b".into())).unwrap();
                room.take_events()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let fetched = repo.get(&RoomId("R".into())).await.unwrap();
        assert_eq!(fetched.members().len(), 2);
    }

    #[tokio::test]
    async fn find_by_owner_id_returns_only_that_owners_rooms() {
        let repo = InMemoryRoomRepository::new(Arc::new(SeqGen::default()));
        repo.insert(
            Room::create(RoomId("R1".into()), PeerId("a".into()), rules(), repo.seq())
                .unwrap(),
        )
        .await;
        repo.insert(
            Room::create(RoomId("R2".into()), PeerId("a".into()), rules(), repo.seq())
                .unwrap(),
        )
        .await;
        repo.insert(
            Room::create(RoomId("R3".into()), PeerId("b".into()), rules(), repo.seq())
                .unwrap(),
        )
        .await;

        let mut owned = repo.find_by_owner_id(&PeerId("a".into())).await;
        owned.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(owned, vec![RoomId("R1".into()), RoomId("R2".into())]);
    }
}
