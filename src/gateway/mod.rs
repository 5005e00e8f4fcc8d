//! The external boundary: WebSocket ingress, per-peer fan-out, queue
//! producer, relay dispatcher, and the administrative HTTP surface.

pub mod http;
pub mod session;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use actix::prelude::*;
use broker_protocol::{ConnectionState, FallbackMode, PeerId, RoomId, RoomRules};
use chrono::{DateTime, Utc};
use failure::Fail;

use crate::{
    conf::Server as ServerConf,
    connection::{
        ConnectionServiceActor, ReconnectTriggered, SetFallbackMode,
        UpdateConnectionState,
    },
    events::{DomainEvent, Publisher, SeqGen},
    peer_connection::{
        repo::{InMemoryPeerConnectionRepository, PeerConnectionRepository},
        ConnectionId, PeerConnection,
    },
    prelude::*,
    queue::{BatchProcessConnection, Enqueue, MessageKind, QueueActor, SignalingMessage},
    room::{
        repo::{InMemoryRoomRepository, RoomRepository},
        Room, RoomError,
    },
};

/// Errors the gateway surfaces to a client as a single-frame `error` event.
#[derive(Debug, Fail)]
pub enum GatewayError {
    #[fail(display = "{}", _0)]
    Room(#[fail(cause)] RoomError),

    #[fail(display = "room has reached its connection limit")]
    MaxConnections,

    #[fail(display = "peer not found in room")]
    PeerNotFound,

    #[fail(display = "fallback relay is not enabled for this pair")]
    FallbackNotEnabled,

    #[fail(display = "room not found")]
    UnknownRoom,

    #[fail(display = "only the room owner may perform this action")]
    NotRoomOwner,
}

impl GatewayError {
    /// Stable machine-readable code, where the error taxonomy (§7) defines
    /// one. State errors surface as a bare `message` instead.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::MaxConnections => Some("ERR_MAX_CONNECTIONS"),
            Self::PeerNotFound => Some("ERR_PEER_NOT_FOUND"),
            Self::FallbackNotEnabled => Some("ERR_FALLBACK_NOT_ENABLED"),
            Self::UnknownRoom => Some("ERR_UNKNOWN_ROOM"),
            Self::NotRoomOwner => Some("ERR_NOT_ROOM_OWNER"),
            Self::Room(_) => None,
        }
    }
}

impl From<RoomError> for GatewayError {
    fn from(e: RoomError) -> Self {
        Self::Room(e)
    }
}

impl From<crate::room::repo::RepoError> for GatewayError {
    fn from(_: crate::room::repo::RepoError) -> Self {
        Self::UnknownRoom
    }
}

/// Sent by a [`session::WsSession`] into itself via the injected socket
/// recipient, and by the gateway to broadcast/unicast server events.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct ToClient(pub broker_protocol::ServerEvent);

pub(crate) type SocketMap = StdMutex<HashMap<PeerId, Vec<Recipient<ToClient>>>>;

fn unicast_via(sockets: &SocketMap, peer_id: &PeerId, event: broker_protocol::ServerEvent) {
    if let Some(recipients) = sockets.lock().unwrap().get(peer_id) {
        for r in recipients {
            let _ = r.do_send(ToClient(event.clone()));
        }
    }
}

/// Transient, gateway-local per-room statistics (§3).
#[derive(Clone, Copy, Debug)]
pub(crate) struct RoomStats {
    member_count: u32,
    active_connections: u32,
    last_updated: DateTime<Utc>,
    /// Cleared by [`RoomStatsMonitor`] once it observes the room is closed
    /// or empty. Refreshing the entry (a new join) always sets this back
    /// to `true`.
    active: bool,
}

impl RoomStats {
    fn new(member_count: u32, active_connections: u32) -> Self {
        Self {
            member_count,
            active_connections,
            last_updated: Utc::now(),
            active: true,
        }
    }
}

/// Shared state behind every gateway request, wired once in `main` and
/// handed out via `actix_web::web::Data`.
pub struct GatewayState {
    pub(crate) room_repo: Arc<InMemoryRoomRepository>,
    pub(crate) peer_repo: Arc<InMemoryPeerConnectionRepository>,
    pub(crate) publisher: Arc<Publisher>,
    pub(crate) queue: Addr<QueueActor>,
    pub(crate) connection_service: Addr<ConnectionServiceActor>,
    sockets: Arc<SocketMap>,
    room_stats: Arc<StdMutex<HashMap<RoomId, RoomStats>>>,
    pub(crate) conf: ServerConf,
    pub(crate) log: slog::Logger,
}

impl GatewayState {
    /// `sockets` is constructed independently in `main` and shared with a
    /// [`ReconnectNotifier`] *before* this is called, because
    /// `connection_service` (built from a [`ReconnectNotifier`] recipient)
    /// must already exist to pass in here — see `main` for the wiring order.
    #[must_use]
    pub fn new(
        room_repo: Arc<InMemoryRoomRepository>,
        peer_repo: Arc<InMemoryPeerConnectionRepository>,
        publisher: Arc<Publisher>,
        queue: Addr<QueueActor>,
        connection_service: Addr<ConnectionServiceActor>,
        sockets: Arc<SocketMap>,
        conf: ServerConf,
        log: slog::Logger,
    ) -> Self {
        Self {
            room_repo,
            peer_repo,
            publisher,
            queue,
            connection_service,
            sockets,
            room_stats: Arc::new(StdMutex::new(HashMap::new())),
            conf,
            log,
        }
    }

    /// Shares the room-stats table with a [`RoomStatsMonitor`].
    pub(crate) fn room_stats_handle(
        &self,
    ) -> Arc<StdMutex<HashMap<RoomId, RoomStats>>> {
        Arc::clone(&self.room_stats)
    }

    /// Registers a freshly-connected socket under `peer_id`. A peer may hold
    /// more than one concurrent socket (reconnect handoff).
    pub fn register_socket(&self, peer_id: PeerId, socket: Recipient<ToClient>) {
        self.sockets.lock().unwrap().entry(peer_id).or_default().push(socket);
    }

    /// Deregisters `socket`. Returns `true` if this was the peer's last
    /// remaining socket.
    pub fn deregister_socket(&self, peer_id: &PeerId, socket: &Recipient<ToClient>) -> bool {
        let mut sockets = self.sockets.lock().unwrap();
        let peer_sockets = match sockets.get_mut(peer_id) {
            Some(s) => s,
            None => return true,
        };
        peer_sockets.retain(|s| s != socket);
        let emptied = peer_sockets.is_empty();
        if emptied {
            sockets.remove(peer_id);
        }
        emptied
    }

    fn unicast(&self, peer_id: &PeerId, event: broker_protocol::ServerEvent) {
        unicast_via(&self.sockets, peer_id, event);
    }

    fn broadcast(
        &self,
        peers: impl Iterator<Item = PeerId>,
        event: broker_protocol::ServerEvent,
    ) {
        for peer_id in peers {
            self.unicast(&peer_id, event.clone());
        }
    }

    fn refresh_room_stats(&self, room_id: &RoomId, member_count: u32, active_connections: u32) {
        self.room_stats
            .lock()
            .unwrap()
            .insert(room_id.clone(), RoomStats::new(member_count, active_connections));
    }

    /// `join {roomId, peerId}` (§4.6).
    pub async fn join(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
    ) -> Result<(), GatewayError> {
        let active_connections =
            self.peer_repo.find_by_room(room_id).await.len() as u32;
        if active_connections >= self.conf.max_connections_per_room {
            return Err(GatewayError::MaxConnections);
        }

        let events = self
            .room_repo
            .mutate(room_id, |room: &mut Room| {
                room.join(peer_id.clone())?;
                Ok::<_, RoomError>(room.take_events())
            })
            .await??;
        self.publisher.publish_all(events).await;

        let room = self.room_repo.get(room_id).await?;
        self.refresh_room_stats(room_id, room.members().len() as u32, active_connections);

        let total_players = room.members().len() as u32;
        self.broadcast(
            room.members().iter().cloned(),
            broker_protocol::ServerEvent::PlayerJoined {
                peer_id: peer_id.clone(),
                room_id: room_id.clone(),
                total_players,
                is_room_owner: room.is_owner(peer_id),
            },
        );
        self.unicast(
            peer_id,
            broker_protocol::ServerEvent::RoomState {
                room_id: room_id.clone(),
                owner_id: room.owner_id().clone(),
                players: room.members().iter().cloned().collect(),
                rules: *room.rules(),
            },
        );
        Ok(())
    }

    /// `leave {roomId, peerId}`, and the terminal step of socket disconnect.
    pub async fn leave(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
    ) -> Result<(), GatewayError> {
        let members_before = self.room_repo.get(room_id).await?.members().clone();

        let events = self
            .room_repo
            .mutate(room_id, |room: &mut Room| {
                room.leave(peer_id)?;
                Ok::<_, RoomError>(room.take_events())
            })
            .await??;
        self.publisher.publish_all(events).await;

        self.broadcast(
            members_before.into_iter(),
            broker_protocol::ServerEvent::PlayerLeft {
                peer_id: peer_id.clone(),
                room_id: room_id.clone(),
            },
        );
        Ok(())
    }

    /// `offer`/`answer`/`ice-candidate {roomId, from, to, payload}`.
    pub async fn forward_signaling(
        &self,
        kind: MessageKind,
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    ) {
        self.unicast(&to, Self::wire_event(kind, from.clone(), payload.clone()));

        self.queue.do_send(Enqueue(SignalingMessage {
            kind,
            from,
            to,
            room_id,
            payload,
            enqueued_at: Utc::now(),
        }));
    }

    fn wire_event(
        kind: MessageKind,
        from: PeerId,
        payload: serde_json::Value,
    ) -> broker_protocol::ServerEvent {
        match kind {
            MessageKind::Offer => broker_protocol::ServerEvent::Offer { from, offer: payload },
            MessageKind::Answer => {
                broker_protocol::ServerEvent::Answer { from, answer: payload }
            }
            MessageKind::IceCandidate => broker_protocol::ServerEvent::IceCandidate {
                from,
                candidate: payload,
            },
        }
    }

    /// `connection-state {roomId, peerId, state}`.
    pub async fn connection_state_report(
        &self,
        room_id: RoomId,
        peer_id: PeerId,
        state: ConnectionState,
    ) {
        self.connection_service.do_send(UpdateConnectionState {
            peer_id: peer_id.clone(),
            new_state: state,
        });

        for connection_id in self.peer_repo.find_by_peer(&peer_id).await {
            let counterpart = if connection_id.local == peer_id {
                connection_id.remote.clone()
            } else {
                connection_id.local.clone()
            };

            self.unicast(
                &counterpart,
                broker_protocol::ServerEvent::PeerConnectionState {
                    peer_id: peer_id.clone(),
                    state,
                },
            );

            if state == ConnectionState::Failed {
                let using_fallback = self
                    .connection_service
                    .send(crate::connection::IsUsingFallback(connection_id))
                    .await
                    .unwrap_or(false);
                if !using_fallback {
                    self.unicast(
                        &peer_id,
                        broker_protocol::ServerEvent::WebrtcFallbackSuggested {
                            from: counterpart.clone(),
                            room_id: room_id.clone(),
                            reason: "connection failed".into(),
                        },
                    );
                    self.unicast(
                        &counterpart,
                        broker_protocol::ServerEvent::WebrtcFallbackSuggested {
                            from: peer_id.clone(),
                            room_id: room_id.clone(),
                            reason: "connection failed".into(),
                        },
                    );
                }
            }
        }
    }

    /// `reconnect-request {roomId, from, to}`.
    pub async fn reconnect_request(
        &self,
        room_id: &RoomId,
        from: PeerId,
        to: PeerId,
    ) -> Result<(), GatewayError> {
        let room = self.room_repo.get(room_id).await?;
        if !room.has_player(&to) {
            return Err(GatewayError::PeerNotFound);
        }
        self.unicast(&to, broker_protocol::ServerEvent::ReconnectNeeded { from });
        Ok(())
    }

    /// `webrtc-fallback-activate {roomId, from, to}`.
    pub async fn activate_fallback(
        &self,
        room_id: &RoomId,
        from: PeerId,
        to: PeerId,
    ) -> Result<(), GatewayError> {
        let room = self.room_repo.get(room_id).await?;
        if !room.has_player(&to) {
            return Err(GatewayError::PeerNotFound);
        }

        self.connection_service.do_send(SetFallbackMode {
            local: from.clone(),
            remote: to.clone(),
            room_id: room_id.clone(),
            mode: FallbackMode::Websocket,
        });

        self.unicast(
            &to,
            broker_protocol::ServerEvent::WebrtcFallbackNeeded {
                from: from.clone(),
                room_id: room_id.clone(),
            },
        );
        self.unicast(
            &from,
            broker_protocol::ServerEvent::WebrtcFallbackActivated {
                to,
                success: true,
            },
        );
        Ok(())
    }

    /// `relay-data {roomId, from, to, payload}`.
    pub async fn relay_data(
        &self,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    ) -> Result<(), GatewayError> {
        let connection_id = ConnectionId::new(from.clone(), to.clone());
        let using_fallback = self
            .connection_service
            .send(crate::connection::IsUsingFallback(connection_id))
            .await
            .unwrap_or(false);

        if !using_fallback {
            return Err(GatewayError::FallbackNotEnabled);
        }

        self.unicast(&to, broker_protocol::ServerEvent::RelayData { from, payload });
        Ok(())
    }

}

/// Routes [`ReconnectTriggered`] notifications from the connection service
/// into the socket map directly, rather than via `GatewayState`. This is
/// what breaks the construction cycle: `GatewayState::new` needs
/// `connection_service`'s `Addr`, and `ConnectionServiceActor::new` needs
/// this actor's recipient, so neither side can wait on a fully-built
/// `GatewayState` — `sockets` is built once in `main` and shared by both.
pub struct ReconnectNotifier(pub Arc<SocketMap>);

impl Actor for ReconnectNotifier {
    type Context = Context<Self>;
}

impl Handler<ReconnectTriggered> for ReconnectNotifier {
    type Result = ();

    fn handle(&mut self, msg: ReconnectTriggered, _ctx: &mut Self::Context) {
        unicast_via(
            &self.0,
            &msg.connection_id.remote,
            broker_protocol::ServerEvent::ReconnectNeeded {
                from: msg.connection_id.local,
            },
        );
    }
}

/// Applies a coalesced drain-tick batch to its peer-connection aggregate and
/// flushes the resulting domain events.
pub struct BatchProcessor {
    peer_repo: Arc<InMemoryPeerConnectionRepository>,
    publisher: Arc<Publisher>,
    log: slog::Logger,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(
        peer_repo: Arc<InMemoryPeerConnectionRepository>,
        publisher: Arc<Publisher>,
        log: slog::Logger,
    ) -> Self {
        Self {
            peer_repo,
            publisher,
            log,
        }
    }
}

impl Actor for BatchProcessor {
    type Context = Context<Self>;
}

impl Handler<BatchProcessConnection> for BatchProcessor {
    type Result = ResponseFuture<()>;

    fn handle(
        &mut self,
        batch: BatchProcessConnection,
        _ctx: &mut Self::Context,
    ) -> Self::Result {
        let peer_repo = Arc::clone(&self.peer_repo);
        let publisher = Arc::clone(&self.publisher);
        let log = self.log.clone();

        Box::pin(async move {
            let connection_id = batch.connection_id.clone();
            let _pc =
                peer_repo.get_or_create(&connection_id, &batch.room_id).await;

            let result = peer_repo
                .mutate(&connection_id, |pc: &mut PeerConnection| {
                    if let Some(_offer) = &batch.offer {
                        pc.handle_offer();
                    }
                    if let Some(_answer) = &batch.answer {
                        pc.handle_answer();
                    }
                    for _ in &batch.ice_candidates {
                        pc.handle_ice_candidate();
                    }
                    pc.take_events()
                })
                .await;

            match result {
                Ok(events) => publisher.publish_all(events).await,
                Err(e) => error!(
                    log, "Failed to process signaling batch, continuing";
                    "connection" => %connection_id, "error" => %e,
                ),
            }
        })
    }
}

/// Periodically reaps idle room-stats entries (§4.6).
pub struct RoomStatsMonitor {
    room_repo: Arc<InMemoryRoomRepository>,
    room_stats: Arc<StdMutex<HashMap<RoomId, RoomStats>>>,
    interval: std::time::Duration,
    log: slog::Logger,
}

const STATS_REAP_IDLE: std::time::Duration = std::time::Duration::from_secs(600);
const STATS_INACTIVE_AFTER: std::time::Duration = std::time::Duration::from_secs(300);

impl Actor for RoomStatsMonitor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(self.log, "Room stats monitor started"; "interval" => ?self.interval);
        ctx.run_interval(self.interval, |act, ctx| act.tick(ctx));
    }
}

impl RoomStatsMonitor {
    fn tick(&mut self, ctx: &mut Context<Self>) {
        let now = Utc::now();
        let mut stats = self.room_stats.lock().unwrap();

        let stale: Vec<RoomId> = stats
            .iter()
            .filter(|(_, s)| {
                (now - s.last_updated)
                    .to_std()
                    .map_or(false, |d| d > STATS_REAP_IDLE)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            stats.remove(id);
        }

        let candidates: Vec<RoomId> = stats
            .iter()
            .filter(|(_, s)| {
                s.active
                    && (now - s.last_updated)
                        .to_std()
                        .map_or(false, |d| d > STATS_INACTIVE_AFTER)
            })
            .map(|(id, _)| id.clone())
            .collect();
        drop(stats);

        for id in candidates {
            let room_repo = Arc::clone(&self.room_repo);
            let room_stats = Arc::clone(&self.room_stats);
            let lookup_id = id.clone();
            ctx.spawn(
                actix::fut::wrap_future(async move { room_repo.get(&id).await })
                    .map(move |result, _actor: &mut Self, _ctx| {
                        if let Ok(room) = result {
                            if !room.is_active() || room.members().is_empty() {
                                if let Some(s) =
                                    room_stats.lock().unwrap().get_mut(&lookup_id)
                                {
                                    s.active = false;
                                }
                            }
                        }
                    }),
            );
        }
    }
}

impl RoomStatsMonitor {
    #[must_use]
    pub fn new(
        room_repo: Arc<InMemoryRoomRepository>,
        room_stats: Arc<StdMutex<HashMap<RoomId, RoomStats>>>,
        interval: std::time::Duration,
        log: slog::Logger,
    ) -> Self {
        Self {
            room_repo,
            room_stats,
            interval,
            log,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RulesUpdate {
    pub max_players: Option<u32>,
    pub allow_relay: Option<bool>,
    pub latency_target_ms: Option<u32>,
    pub opus_bitrate: Option<u32>,
}

impl RulesUpdate {
    fn apply(self, current: RoomRules) -> RoomRules {
        RoomRules {
            max_players: self.max_players.unwrap_or(current.max_players),
            allow_relay: self.allow_relay.unwrap_or(current.allow_relay),
            latency_target_ms: self
                .latency_target_ms
                .unwrap_or(current.latency_target_ms),
            opus_bitrate: self.opus_bitrate.unwrap_or(current.opus_bitrate),
        }
    }
}

impl GatewayState {
    /// `POST /rooms` use-case.
    pub async fn create_room(
        &self,
        room_id: RoomId,
        owner_id: PeerId,
        rules: RoomRules,
        seq: Arc<SeqGen>,
    ) -> Result<(), GatewayError> {
        let room = Room::create(room_id, owner_id, rules, seq)?;
        let events = {
            let mut room = room;
            let events = room.take_events();
            self.room_repo.insert(room).await;
            events
        };
        self.publisher.publish_all(events).await;
        Ok(())
    }

    /// `PATCH /rooms/:id/rules` use-case.
    pub async fn update_room_rules(
        &self,
        room_id: &RoomId,
        caller: &PeerId,
        update: RulesUpdate,
    ) -> Result<(), GatewayError> {
        let room = self.room_repo.get(room_id).await?;
        if !room.is_owner(caller) {
            return Err(GatewayError::NotRoomOwner);
        }
        let new_rules = update.apply(*room.rules());

        let events = self
            .room_repo
            .mutate(room_id, |room: &mut Room| {
                room.update_rules(new_rules)?;
                Ok::<_, RoomError>(room.take_events())
            })
            .await??;
        self.publisher.publish_all(events).await;
        Ok(())
    }

    /// `DELETE /rooms/:id` use-case.
    pub async fn close_room(
        &self,
        room_id: &RoomId,
        caller: &PeerId,
    ) -> Result<(), GatewayError> {
        let room = self.room_repo.get(room_id).await?;
        if !room.is_owner(caller) {
            return Err(GatewayError::NotRoomOwner);
        }

        let events = self
            .room_repo
            .mutate(room_id, |room: &mut Room| {
                room.close()?;
                Ok::<_, RoomError>(room.take_events())
            })
            .await??;
        self.publisher.publish_all(events).await;
        Ok(())
    }

    /// `GET /rooms/:id` use-case.
    pub async fn get_room(&self, room_id: &RoomId) -> Result<Room, GatewayError> {
        Ok(self.room_repo.get(room_id).await?)
    }
}
