//! Domain-event taxonomy and publisher.
//!
//! Aggregates never call the publisher directly — they buffer
//! [`DomainEvent`]s in an append-only `Vec` (see `Room::take_events` and
//! `PeerConnection::take_events`) and the use-case that invoked the mutation
//! pulls them and hands them to [`Publisher::publish_all`]. This keeps the
//! aggregates free of any ambient reference to the publisher.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
};

use broker_protocol::{ConnectionState, PeerId, RoomId, RoomRules};
use futures::future::{BoxFuture, Future};

use crate::prelude::*;

/// Monotonically increasing sequence number, unique within one
/// [`Publisher`] instance. Stands in for `occurredOn` — ordering by this
/// value is meaningful even if wall-clock time is adjusted mid-process.
pub type Seq = u64;

/// A fact about a mutation that happened to some aggregate.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    RoomCreated {
        seq: Seq,
        room_id: RoomId,
        owner_id: PeerId,
        rules: RoomRules,
    },
    PlayerJoined {
        seq: Seq,
        room_id: RoomId,
        peer_id: PeerId,
    },
    PlayerLeft {
        seq: Seq,
        room_id: RoomId,
        peer_id: PeerId,
    },
    RoomRuleChanged {
        seq: Seq,
        room_id: RoomId,
        rules: RoomRules,
    },
    RoomClosed {
        seq: Seq,
        room_id: RoomId,
    },
    ConnectionStateChanged {
        seq: Seq,
        room_id: RoomId,
        peer_id: PeerId,
        state: ConnectionState,
        previous_state: ConnectionState,
    },
    IceCandidateReceived {
        seq: Seq,
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
    },
    OfferReceived {
        seq: Seq,
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
    },
    AnswerReceived {
        seq: Seq,
        room_id: RoomId,
        from: PeerId,
        to: PeerId,
    },
    ConnectionTimeout {
        seq: Seq,
        room_id: RoomId,
        peer_id: PeerId,
        timeout_ms: u64,
    },
}

impl DomainEvent {
    /// The stable event name used to look up registered handlers.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomCreated { .. } => "room-created",
            Self::PlayerJoined { .. } => "player-joined",
            Self::PlayerLeft { .. } => "player-left",
            Self::RoomRuleChanged { .. } => "room-rule-changed",
            Self::RoomClosed { .. } => "room-closed",
            Self::ConnectionStateChanged { .. } => "connection-state-changed",
            Self::IceCandidateReceived { .. } => "ice-candidate-received",
            Self::OfferReceived { .. } => "offer-received",
            Self::AnswerReceived { .. } => "answer-received",
            Self::ConnectionTimeout { .. } => "connection-timeout",
        }
    }

    /// `occurredOn` ordering key.
    #[must_use]
    pub fn seq(&self) -> Seq {
        match *self {
            Self::RoomCreated { seq, .. }
            | Self::PlayerJoined { seq, .. }
            | Self::PlayerLeft { seq, .. }
            | Self::RoomRuleChanged { seq, .. }
            | Self::RoomClosed { seq, .. }
            | Self::ConnectionStateChanged { seq, .. }
            | Self::IceCandidateReceived { seq, .. }
            | Self::OfferReceived { seq, .. }
            | Self::AnswerReceived { seq, .. }
            | Self::ConnectionTimeout { seq, .. } => seq,
        }
    }
}

/// Allocates [`Seq`] values for freshly-created [`DomainEvent`]s. Shared by
/// every aggregate instance so cross-aggregate ordering within one process
/// is well defined.
#[derive(Debug, Default)]
pub struct SeqGen(AtomicU64);

impl SeqGen {
    #[must_use]
    pub fn next(&self) -> Seq {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A registered callback. Boxed so handlers of different closures/futures
/// can share one `Vec`.
type Handler =
    Box<dyn Fn(&DomainEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opaque handle returned by [`Publisher::register`], passed back to
/// [`Publisher::unregister`] to remove that specific handler. `Fn` trait
/// objects aren't comparable, so identity is tracked by an id instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HandlerId {
    event_name: &'static str,
    id: u64,
}

/// Multicasts [`DomainEvent`]s, by event name, to registered handlers, in
/// the order they were published.
#[derive(Default)]
pub struct Publisher {
    handlers: HashMap<&'static str, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
    log: Option<slog::Logger>,
}

impl Publisher {
    #[must_use]
    pub fn new(log: slog::Logger) -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: AtomicU64::new(0),
            log: Some(log),
        }
    }

    /// Registers `handler` to run whenever an event named `event_name` is
    /// published. Duplicates are permitted; each registration fires once.
    /// The returned [`HandlerId`] can later be passed to
    /// [`Publisher::unregister`] to remove just this handler.
    pub fn register<F, Fut>(
        &mut self,
        event_name: &'static str,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(&DomainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(event_name)
            .or_default()
            .push((id, Box::new(move |ev| Box::pin(handler(ev)))));
        HandlerId { event_name, id }
    }

    /// Removes the handler identified by `handle`, previously returned by
    /// [`Publisher::register`]. No-op if it was already removed.
    pub fn unregister(&mut self, handle: HandlerId) {
        if let Some(handlers) = self.handlers.get_mut(handle.event_name) {
            handlers.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Fans `event` out to every handler registered for its name, awaiting
    /// all of them.
    pub async fn publish(&self, event: &DomainEvent) {
        if let Some(handlers) = self.handlers.get(event.name()) {
            let futures: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> =
                handlers.iter().map(|(_, h)| h(event)).collect();
            for fut in futures {
                fut.await;
            }
        } else if let Some(log) = &self.log {
            trace!(log, "No handlers registered"; "event" => event.name());
        }
    }

    /// Publishes each event in `events`, in order. A batch never aborts
    /// early: every event is attempted even if an earlier one's handler
    /// panicked inside `publish` (at-least-once semantics within the batch).
    pub async fn publish_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.publish(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn room_created(seq: Seq) -> DomainEvent {
        DomainEvent::RoomCreated {
            seq,
            room_id: RoomId("R".into()),
            owner_id: PeerId("u1".into()),
            rules: RoomRules {
                max_players: 2,
                allow_relay: true,
                latency_target_ms: 100,
                opus_bitrate: 64_000,
            },
        }
    }

    #[tokio::test]
    async fn publishes_to_every_registered_handler_in_order() {
        let mut publisher = Publisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..2 {
            let seen = Arc::clone(&seen);
            publisher.register("room-created", move |ev| {
                let seen = Arc::clone(&seen);
                let seq = ev.seq();
                async move {
                    seen.lock().unwrap().push((tag, seq));
                }
            });
        }

        publisher.publish(&room_created(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (1, 1)]);
    }

    #[tokio::test]
    async fn publish_all_preserves_batch_order() {
        let mut publisher = Publisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        publisher.register("room-created", move |ev| {
            let seen = Arc::clone(&handler_seen);
            let seq = ev.seq();
            async move {
                seen.lock().unwrap().push(seq);
            }
        });

        publisher
            .publish_all(vec![room_created(1), room_created(2), room_created(3)])
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn seq_gen_is_monotonic() {
        let gen = SeqGen::default();
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
    }

    #[tokio::test]
    async fn unregister_removes_only_the_matching_handler() {
        let mut publisher = Publisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let kept_seen = Arc::clone(&seen);
        publisher.register("room-created", move |ev| {
            let seen = Arc::clone(&kept_seen);
            let seq = ev.seq();
            async move {
                seen.lock().unwrap().push(seq);
            }
        });

        let removed_seen = Arc::clone(&seen);
        let removed = publisher.register("room-created", move |ev| {
            let seen = Arc::clone(&removed_seen);
            let seq = ev.seq();
            async move {
                seen.lock().unwrap().push(seq + 100);
            }
        });

        publisher.unregister(removed);
        publisher.publish(&room_created(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
