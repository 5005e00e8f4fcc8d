//! Storage seam for [`PeerConnection`] aggregates.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use broker_protocol::{PeerId, RoomId};
use failure::Fail;
use tokio::sync::Mutex;

use super::{ConnectionId, PeerConnection};
use crate::events::SeqGen;

/// Errors raised while locating or persisting a [`PeerConnection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Fail)]
pub enum RepoError {
    #[fail(display = "peer connection not found")]
    NotFound,
}

/// Storage seam for [`PeerConnection`] aggregates.
#[async_trait]
pub trait PeerConnectionRepository: Send + Sync {
    async fn insert(&self, pc: PeerConnection);

    async fn get(&self, id: &ConnectionId) -> Result<PeerConnection, RepoError>;

    /// Gets the entry for `id`, lazily creating one via `room_id` if absent.
    async fn get_or_create(
        &self,
        id: &ConnectionId,
        room_id: &RoomId,
    ) -> PeerConnection;

    async fn mutate<F, T>(&self, id: &ConnectionId, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut PeerConnection) -> T + Send;

    async fn remove(&self, id: &ConnectionId);

    async fn find_by_room(&self, room_id: &RoomId) -> Vec<ConnectionId>;

    /// Matches `peer_id` against either direction of a stored key.
    async fn find_by_peer(&self, peer_id: &PeerId) -> Vec<ConnectionId>;
}

/// `Mutex<HashMap<..>>`-backed implementation, sufficient for a single
/// broker process.
pub struct InMemoryPeerConnectionRepository {
    connections: Mutex<HashMap<ConnectionId, PeerConnection>>,
    seq: Arc<SeqGen>,
}

impl InMemoryPeerConnectionRepository {
    #[must_use]
    pub fn new(seq: Arc<SeqGen>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            seq,
        }
    }

    #[must_use]
    pub fn seq(&self) -> Arc<SeqGen> {
        Arc::clone(&self.seq)
    }

    fn hydrate_copy(pc: &PeerConnection, seq: Arc<SeqGen>) -> PeerConnection {
        PeerConnection::hydrate(
            pc.id().clone(),
            pc.room_id().clone(),
            pc.state(),
            pc.last_connected_at(),
            pc.ice_candidates_count(),
            pc.created_at(),
            pc.updated_at(),
            seq,
        )
    }
}

#[async_trait]
impl PeerConnectionRepository for InMemoryPeerConnectionRepository {
    async fn insert(&self, pc: PeerConnection) {
        self.connections.lock().await.insert(pc.id().clone(), pc);
    }

    async fn get(&self, id: &ConnectionId) -> Result<PeerConnection, RepoError> {
        self.connections
            .lock()
            .await
            .get(id)
            .map(|pc| Self::hydrate_copy(pc, Arc::clone(&self.seq)))
            .ok_or(RepoError::NotFound)
    }

    async fn get_or_create(
        &self,
        id: &ConnectionId,
        room_id: &RoomId,
    ) -> PeerConnection {
        let mut connections = self.connections.lock().await;
        if let Some(pc) = connections.get(id) {
            return Self::hydrate_copy(pc, Arc::clone(&self.seq));
        }
        let pc = PeerConnection::create(
            room_id.clone(),
            id.local.clone(),
            id.remote.clone(),
            Arc::clone(&self.seq),
        );
        let copy = Self::hydrate_copy(&pc, Arc::clone(&self.seq));
        connections.insert(id.clone(), pc);
        copy
    }

    async fn mutate<F, T>(&self, id: &ConnectionId, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut PeerConnection) -> T + Send,
    {
        let mut connections = self.connections.lock().await;
        let pc = connections.get_mut(id).ok_or(RepoError::NotFound)?;
        Ok(f(pc))
    }

    async fn remove(&self, id: &ConnectionId) {
        self.connections.lock().await.remove(id);
    }

    async fn find_by_room(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .await
            .values()
            .filter(|pc| pc.room_id() == room_id)
            .map(|pc| pc.id().clone())
            .collect()
    }

    async fn find_by_peer(&self, peer_id: &PeerId) -> Vec<ConnectionId> {
        self.connections
            .lock()
            .await
            .keys()
            .filter(|id| &id.local == peer_id || &id.remote == peer_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let repo = InMemoryPeerConnectionRepository::new(Arc::new(SeqGen::default()));
        let id = ConnectionId::new(PeerId("a".into()), PeerId("b".into()));
        let room = RoomId("R".into());

        let first = repo.get_or_create(&id, &room).await;
        assert_eq!(first.ice_candidates_count(), 0);

        repo.mutate(&id, |pc| pc.handle_ice_candidate())
            .await
            .unwrap();

        let second = repo.get_or_create(&id, &room).await;
        assert_eq!(second.ice_candidates_count(), 1);
    }

    #[tokio::test]
    async fn find_by_peer_matches_either_direction() {
        let repo = InMemoryPeerConnectionRepository::new(Arc::new(SeqGen::default()));
        let room = RoomId("R".into());
        repo.get_or_create(
            &ConnectionId::new(PeerId("a".into()), PeerId("b".into())),
            &room,
        )
        .await;
        repo.get_or_create(
            &ConnectionId::new(PeerId("b".into()), PeerId("a".into())),
            &room,
        )
        .await;

        let found = repo.find_by_peer(&PeerId("a".into())).await;
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn get_missing_errors() {
        let repo = InMemoryPeerConnectionRepository::new(Arc::new(SeqGen::default()));
        let id = ConnectionId::new(PeerId("a".into()), PeerId("b".into()));
        assert_eq!(repo.get(&id).await.unwrap_err(), RepoError::NotFound);
    }
}
