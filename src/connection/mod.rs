//! Connection service: in-memory pairwise health tracker.
//!
//! Runs as an [`actix`] actor with two background loops (`ctx.run_interval`)
//! — a health monitor and a stale/exhausted-entry reaper — alongside the
//! request/response handlers the gateway drives directly.

use std::{collections::HashMap, sync::Arc};

use actix::prelude::*;
use broker_protocol::{ConnectionState, FallbackMode, PeerId, RoomId};
use chrono::{DateTime, Utc};

use crate::{
    conf::Connection as ConnectionConf,
    events::Publisher,
    peer_connection::{
        repo::{InMemoryPeerConnectionRepository, PeerConnectionRepository},
        ConnectionId, PeerConnection,
    },
    prelude::*,
};

/// In-memory mirror of one pairwise connection's health, kept alongside (but
/// independent of) the persisted [`PeerConnection`] aggregate.
#[derive(Clone, Debug)]
struct HealthEntry {
    room_id: RoomId,
    state: ConnectionState,
    last_updated: DateTime<Utc>,
    reconnect_attempts: u32,
    fallback_mode: FallbackMode,
}

impl HealthEntry {
    fn new(room_id: RoomId, state: ConnectionState) -> Self {
        Self {
            room_id,
            state,
            last_updated: Utc::now(),
            reconnect_attempts: 0,
            fallback_mode: FallbackMode::None,
        }
    }
}

/// Counts partitioned by connection state, plus the total.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub by_state: HashMap<ConnectionState, usize>,
    pub total: usize,
}

/// Sent to the gateway's injected recipient when a reconnection attempt is
/// triggered. The gateway is expected to notify the counterpart peer with
/// `reconnect-needed`.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct ReconnectTriggered {
    pub connection_id: ConnectionId,
}

/// Reports an observed connection-state change for `peer_id`. Applied to
/// every peer-connection aggregate where `peer_id` is either endpoint.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct UpdateConnectionState {
    pub peer_id: PeerId,
    pub new_state: ConnectionState,
}

/// Sets the fallback relay mode for a pair, resolved by either direction.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct SetFallbackMode {
    pub local: PeerId,
    pub remote: PeerId,
    pub room_id: RoomId,
    pub mode: FallbackMode,
}

#[derive(Clone, Debug, Message)]
#[rtype(result = "bool")]
pub struct IsUsingFallback(pub ConnectionId);

#[derive(Clone, Copy, Debug, Message)]
#[rtype(result = "usize")]
pub struct GetFallbackConnectionCount;

#[derive(Clone, Copy, Debug, Message)]
#[rtype(result = "ConnectionStats")]
pub struct GetConnectionStats;

/// The health tracker. One instance per process.
pub struct ConnectionServiceActor {
    entries: HashMap<ConnectionId, HealthEntry>,
    conf: ConnectionConf,
    peer_repo: Arc<InMemoryPeerConnectionRepository>,
    publisher: Arc<Publisher>,
    gateway: Recipient<ReconnectTriggered>,
    log: slog::Logger,
}

impl ConnectionServiceActor {
    #[must_use]
    pub fn new(
        conf: ConnectionConf,
        peer_repo: Arc<InMemoryPeerConnectionRepository>,
        publisher: Arc<Publisher>,
        gateway: Recipient<ReconnectTriggered>,
        log: slog::Logger,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            conf,
            peer_repo,
            publisher,
            gateway,
            log,
        }
    }

    fn mirror_health(
        &mut self,
        id: ConnectionId,
        room_id: RoomId,
        new_state: ConnectionState,
    ) {
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| HealthEntry::new(room_id, new_state));

        let was_connected = entry.state == ConnectionState::Connected;
        let now_unhealthy = matches!(
            new_state,
            ConnectionState::Disconnected | ConnectionState::Failed
        );
        let now_connected = new_state == ConnectionState::Connected;
        let was_unhealthy = matches!(
            entry.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        );

        if was_connected && now_unhealthy {
            entry.reconnect_attempts += 1;
        } else if was_unhealthy && now_connected {
            entry.reconnect_attempts = 0;
        }

        entry.state = new_state;
        entry.last_updated = Utc::now();
    }

    /// Refuses if the attempt budget is exhausted; otherwise increments
    /// attempts, refreshes `last_updated`, and notifies the gateway.
    fn trigger_reconnection(&mut self, id: &ConnectionId) {
        let max = self.conf.max_reconnect_attempts;
        let entry = match self.entries.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.reconnect_attempts >= max {
            return;
        }
        entry.reconnect_attempts += 1;
        entry.last_updated = Utc::now();

        if let Err(e) = self.gateway.do_send(ReconnectTriggered {
            connection_id: id.clone(),
        }) {
            error!(self.log, "Failed to notify gateway of reconnection trigger";
                "connection" => %id, "error" => %e);
        }
    }

    fn monitor_tick(&mut self) {
        let stale_after = *self.conf.stale_after;
        let max = self.conf.max_reconnect_attempts;
        let now = Utc::now();

        let to_trigger: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                (e.state == ConnectionState::Connected
                    && (now - e.last_updated)
                        .to_std()
                        .map_or(false, |d| d > stale_after))
                    || (e.state == ConnectionState::Failed
                        && e.reconnect_attempts < max)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in to_trigger {
            self.trigger_reconnection(&id);
        }
    }

    fn reap_tick(&mut self, ctx: &mut Context<Self>) {
        let reap_after_idle = *self.conf.reap_after_idle;
        let max = self.conf.max_reconnect_attempts;
        let now = Utc::now();

        let to_reap: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                let idle_too_long = (now - e.last_updated)
                    .to_std()
                    .map_or(false, |d| d > reap_after_idle)
                    && e.state != ConnectionState::Connected;
                let exhausted = e.reconnect_attempts >= max
                    && matches!(
                        e.state,
                        ConnectionState::Disconnected | ConnectionState::Failed
                    );
                idle_too_long || exhausted
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in to_reap {
            self.entries.remove(&id);
            let repo = Arc::clone(&self.peer_repo);
            let log = self.log.clone();
            let reaped = id.clone();
            ctx.spawn(actix::fut::wrap_future(async move {
                repo.remove(&reaped).await;
            }).map(move |(), _actor: &mut Self, _ctx| {
                debug!(log, "Reaped stale peer connection"; "connection" => %id);
            }));
        }
    }
}

impl Actor for ConnectionServiceActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(self.log, "Connection service started";
            "monitor_interval" => %self.conf.monitor_interval,
            "reap_interval" => %self.conf.reap_interval);

        ctx.run_interval(*self.conf.monitor_interval, |act, _ctx| {
            act.monitor_tick();
        });
        ctx.run_interval(*self.conf.reap_interval, |act, ctx| {
            act.reap_tick(ctx);
        });
    }
}

impl Handler<UpdateConnectionState> for ConnectionServiceActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(
        &mut self,
        msg: UpdateConnectionState,
        _ctx: &mut Self::Context,
    ) -> Self::Result {
        let peer_repo = Arc::clone(&self.peer_repo);
        let publisher = Arc::clone(&self.publisher);
        let new_state = msg.new_state;

        let fut = async move {
            let ids = peer_repo.find_by_peer(&msg.peer_id).await;
            let mut touched = Vec::new();
            for id in ids {
                let result = peer_repo
                    .mutate(&id, |pc: &mut PeerConnection| {
                        pc.update_connection_state(new_state);
                        (pc.room_id().clone(), pc.take_events())
                    })
                    .await;
                if let Ok((room_id, events)) = result {
                    publisher.publish_all(events).await;
                    touched.push((id, room_id));
                }
            }
            touched
        };

        Box::pin(actix::fut::wrap_future::<_, Self>(fut).map(
            move |touched, actor, _ctx| {
                for (id, room_id) in touched {
                    actor.mirror_health(id, room_id, new_state);
                }
            },
        ))
    }
}

impl Handler<SetFallbackMode> for ConnectionServiceActor {
    type Result = ();

    fn handle(&mut self, msg: SetFallbackMode, _ctx: &mut Self::Context) {
        let forward = ConnectionId::new(msg.local.clone(), msg.remote.clone());
        let reverse = forward.reversed();

        let key = if self.entries.contains_key(&reverse) {
            reverse
        } else {
            forward
        };

        let entering_websocket = msg.mode == FallbackMode::Websocket;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| HealthEntry::new(msg.room_id, ConnectionState::New));

        entry.fallback_mode = msg.mode;
        if entering_websocket {
            entry.reconnect_attempts = entry.reconnect_attempts.saturating_sub(1);
        }
        entry.last_updated = Utc::now();
    }
}

impl Handler<IsUsingFallback> for ConnectionServiceActor {
    type Result = bool;

    fn handle(&mut self, msg: IsUsingFallback, _ctx: &mut Self::Context) -> bool {
        self.entries
            .get(&msg.0)
            .or_else(|| self.entries.get(&msg.0.reversed()))
            .map_or(false, |e| e.fallback_mode == FallbackMode::Websocket)
    }
}

impl Handler<GetFallbackConnectionCount> for ConnectionServiceActor {
    type Result = usize;

    fn handle(
        &mut self,
        _msg: GetFallbackConnectionCount,
        _ctx: &mut Self::Context,
    ) -> usize {
        self.entries
            .values()
            .filter(|e| e.fallback_mode == FallbackMode::Websocket)
            .count()
    }
}

impl Handler<GetConnectionStats> for ConnectionServiceActor {
    type Result = ConnectionStats;

    fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Self::Context,
    ) -> ConnectionStats {
        let mut by_state = HashMap::new();
        for entry in self.entries.values() {
            *by_state.entry(entry.state).or_insert(0) += 1;
        }
        ConnectionStats {
            total: self.entries.len(),
            by_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dead;
    impl Actor for Dead {
        type Context = Context<Self>;
    }
    impl Handler<ReconnectTriggered> for Dead {
        type Result = ();
        fn handle(&mut self, _msg: ReconnectTriggered, _ctx: &mut Self::Context) {}
    }

    fn test_actor(gateway: Recipient<ReconnectTriggered>) -> ConnectionServiceActor {
        ConnectionServiceActor {
            entries: HashMap::new(),
            conf: ConnectionConf::default(),
            peer_repo: Arc::new(InMemoryPeerConnectionRepository::new(Arc::new(
                crate::events::SeqGen::default(),
            ))),
            publisher: Arc::new(Publisher::default()),
            gateway,
            log: slog::Logger::root(slog::Discard, slog::o!()),
        }
    }

    #[actix_rt::test]
    async fn mirror_health_resets_attempts_on_reconnect() {
        let mut actor = test_actor(Dead {}.start().recipient());

        let id = ConnectionId::new(PeerId("a".into()), PeerId("b".into()));
        actor.mirror_health(id.clone(), RoomId("R".into()), ConnectionState::Connected);
        actor.mirror_health(id.clone(), RoomId("R".into()), ConnectionState::Failed);
        assert_eq!(actor.entries[&id].reconnect_attempts, 1);
        actor.mirror_health(id.clone(), RoomId("R".into()), ConnectionState::Connected);
        assert_eq!(actor.entries[&id].reconnect_attempts, 0);
    }

    #[actix_rt::test]
    async fn trigger_reconnection_refuses_past_budget() {
        let mut actor = test_actor(Dead {}.start().recipient());
        let id = ConnectionId::new(PeerId("a".into()), PeerId("b".into()));
        actor.entries.insert(
            id.clone(),
            HealthEntry::new(RoomId("R".into()), ConnectionState::Failed),
        );
        actor.entries.get_mut(&id).unwrap().reconnect_attempts = 3;
        actor.trigger_reconnection(&id);
        assert_eq!(actor.entries[&id].reconnect_attempts, 3);
    }

    struct Recording(Arc<std::sync::Mutex<Vec<ConnectionId>>>);
    impl Actor for Recording {
        type Context = Context<Self>;
    }
    impl Handler<ReconnectTriggered> for Recording {
        type Result = ();
        fn handle(&mut self, msg: ReconnectTriggered, _ctx: &mut Self::Context) {
            self.0.lock().unwrap().push(msg.connection_id);
        }
    }

    /// Drives a real started actor's `run_interval` loops with
    /// `tokio::time::pause`/`advance`: three `Failed` reports, each followed
    /// by a monitor tick that triggers a reconnection, exhaust the
    /// three-attempt budget; a fourth tick then refuses, and a later reap
    /// tick deletes the exhausted entry from both the actor and the
    /// peer-connection repository.
    #[actix_rt::test]
    async fn reconnect_budget_caps_dispatches_then_reaper_deletes() {
        tokio::time::pause();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder: Recipient<ReconnectTriggered> =
            Recording(Arc::clone(&seen)).start().recipient();

        let peer_repo = Arc::new(InMemoryPeerConnectionRepository::new(Arc::new(
            crate::events::SeqGen::default(),
        )));
        let id = ConnectionId::new(PeerId("a".into()), PeerId("b".into()));
        let room_id = RoomId("R".into());
        peer_repo.get_or_create(&id, &room_id).await;

        let conf = ConnectionConf {
            stale_after: humantime::Duration::from(std::time::Duration::from_secs(600)),
            max_reconnect_attempts: 3,
            monitor_interval: humantime::Duration::from(
                std::time::Duration::from_millis(50),
            ),
            reap_interval: humantime::Duration::from(std::time::Duration::from_millis(
                500,
            )),
            reap_after_idle: humantime::Duration::from(std::time::Duration::from_secs(
                600,
            )),
        };

        let addr = ConnectionServiceActor::new(
            conf,
            Arc::clone(&peer_repo),
            Arc::new(Publisher::default()),
            recorder,
            slog::Logger::root(slog::Discard, slog::o!()),
        )
        .start();

        for _ in 0..3 {
            addr.send(UpdateConnectionState {
                peer_id: PeerId("a".into()),
                new_state: ConnectionState::Failed,
            })
            .await
            .unwrap();
            tokio::time::advance(std::time::Duration::from_millis(60)).await;
        }
        assert_eq!(seen.lock().unwrap().len(), 3, "budget allows three triggers");

        let stats = addr.send(GetConnectionStats).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_state[&ConnectionState::Failed], 1);

        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        assert_eq!(
            seen.lock().unwrap().len(),
            3,
            "a fourth tick must refuse past the budget"
        );

        tokio::time::advance(std::time::Duration::from_millis(300)).await;
        tokio::task::yield_now().await;

        let stats = addr.send(GetConnectionStats).await.unwrap();
        assert_eq!(stats.total, 0, "reap tick sweeps the exhausted entry");
        assert!(peer_repo.get(&id).await.is_err());
    }
}
