//! Per-room prioritized signaling message queue and its drain loop.
//!
//! Runs as an [`actix`] actor so the drain tick is driven by
//! `ctx.run_interval` rather than a hand-rolled thread, matching the rest of
//! the broker's background jobs (see [`crate::connection`]).

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    time::Duration as StdDuration,
};

use actix::prelude::*;
use broker_protocol::{PeerId, RoomId};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::{conf::Queue as QueueConf, peer_connection::ConnectionId, prelude::*};

/// The three signaling message kinds the queue orders and coalesces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    /// Fixed priority mapping from §3: lower sorts earlier.
    fn priority(self) -> u8 {
        match self {
            Self::Offer => 1,
            Self::Answer => 2,
            Self::IceCandidate => 3,
        }
    }
}

/// A signaling message awaiting processing by the drain loop.
#[derive(Clone, Debug)]
pub struct SignalingMessage {
    pub kind: MessageKind,
    pub from: PeerId,
    pub to: PeerId,
    pub room_id: RoomId,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl SignalingMessage {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.from.clone(), self.to.clone())
    }
}

/// Wraps a [`SignalingMessage`] with the ordering key `(priority, seq)`.
/// `seq` is a per-queue monotonic counter, standing in for `enqueuedAt` as
/// the FIFO tie-breaker within one priority class.
#[derive(Debug)]
struct QueuedMessage {
    seq: u64,
    msg: SignalingMessage,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.msg.kind.priority() == other.msg.kind.priority()
            && self.seq == other.seq
    }
}
impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.msg
            .kind
            .priority()
            .cmp(&other.msg.kind.priority())
            .then(self.seq.cmp(&other.seq))
    }
}

/// One room's pending messages, ordered `(priority asc, enqueuedAt asc)` via
/// a min-heap built on [`Reverse`].
#[derive(Default)]
struct RoomQueue {
    heap: BinaryHeap<Reverse<QueuedMessage>>,
    next_seq: u64,
}

impl RoomQueue {
    fn push(&mut self, msg: SignalingMessage, conf: &QueueConf) {
        self.heap.push(Reverse(QueuedMessage {
            seq: self.next_seq,
            msg,
        }));
        self.next_seq += 1;

        if self.heap.len() > conf.backpressure_threshold {
            self.drop_stale_candidates(*conf.candidate_staleness);
        }
    }

    /// Synchronously drops `ice-candidate` entries older than `staleness`.
    /// `offer`/`answer` are never dropped (§4.4).
    fn drop_stale_candidates(&mut self, staleness: StdDuration) {
        let staleness = Duration::from_std(staleness).unwrap_or(Duration::zero());
        let now = Utc::now();
        let kept: Vec<Reverse<QueuedMessage>> = self
            .heap
            .drain()
            .filter(|Reverse(q)| {
                q.msg.kind != MessageKind::IceCandidate
                    || now - q.msg.enqueued_at <= staleness
            })
            .collect();
        self.heap = kept.into_iter().collect();
    }

    fn take_up_to(&mut self, n: usize) -> Vec<SignalingMessage> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.heap.pop() {
                Some(Reverse(q)) => out.push(q.msg),
                None => break,
            }
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// One drain tick's coalesced work for a single pairwise connection.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct BatchProcessConnection {
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    /// Last-wins offer payload observed in this tick, if any.
    pub offer: Option<Value>,
    /// Last-wins answer payload observed in this tick, if any.
    pub answer: Option<Value>,
    /// Every ICE candidate observed in this tick, in arrival order.
    pub ice_candidates: Vec<Value>,
}

impl BatchProcessConnection {
    fn empty(connection_id: ConnectionId, room_id: RoomId) -> Self {
        Self {
            connection_id,
            room_id,
            offer: None,
            answer: None,
            ice_candidates: Vec::new(),
        }
    }
}

/// Enqueues `msg` onto its room's queue.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct Enqueue(pub SignalingMessage);

/// Drives the per-room priority queues and their periodic drain tick.
///
/// The processor is injected as a [`Recipient`] at construction rather than
/// the actor holding a reference back to the gateway, breaking the
/// queue/gateway reference cycle.
pub struct QueueActor {
    rooms: HashMap<RoomId, RoomQueue>,
    conf: QueueConf,
    processor: Recipient<BatchProcessConnection>,
    log: slog::Logger,
}

impl QueueActor {
    #[must_use]
    pub fn new(
        conf: QueueConf,
        processor: Recipient<BatchProcessConnection>,
        log: slog::Logger,
    ) -> Self {
        Self {
            rooms: HashMap::new(),
            conf,
            processor,
            log,
        }
    }

    fn drain_tick(&mut self) {
        for (room_id, queue) in &mut self.rooms {
            if queue.is_empty() {
                continue;
            }

            let batch = queue.take_up_to(self.conf.batch_size);
            let mut groups: HashMap<ConnectionId, BatchProcessConnection> =
                HashMap::new();

            for msg in batch {
                let connection_id = msg.connection_id();
                let group = groups.entry(connection_id.clone()).or_insert_with(|| {
                    BatchProcessConnection::empty(connection_id, room_id.clone())
                });
                match msg.kind {
                    MessageKind::Offer => group.offer = Some(msg.payload),
                    MessageKind::Answer => group.answer = Some(msg.payload),
                    MessageKind::IceCandidate => {
                        group.ice_candidates.push(msg.payload);
                    }
                }
            }

            for (connection_id, group) in groups {
                if let Err(e) = self.processor.do_send(group) {
                    error!(
                        self.log,
                        "Failed to dispatch coalesced batch, continuing with \
                         remaining groups";
                        "connection" => %connection_id,
                        "error" => %e,
                    );
                }
            }
        }
    }
}

impl Actor for QueueActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(self.log, "Message queue started"; "drain_interval" => %self.conf.drain_interval);
        ctx.run_interval(*self.conf.drain_interval, |act, _ctx| {
            act.drain_tick();
        });
    }
}

impl Handler<Enqueue> for QueueActor {
    type Result = ();

    fn handle(&mut self, Enqueue(msg): Enqueue, _ctx: &mut Self::Context) {
        self.rooms
            .entry(msg.room_id.clone())
            .or_default()
            .push(msg, &self.conf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MessageKind, enqueued_at: DateTime<Utc>) -> SignalingMessage {
        SignalingMessage {
            kind,
            from: PeerId("a".into()),
            to: PeerId("b".into()),
            room_id: RoomId("R".into()),
            payload: Value::Null,
            enqueued_at,
        }
    }

    #[test]
    fn priority_then_fifo_ordering() {
        let mut q = RoomQueue::default();
        let conf = QueueConf::default();
        let now = Utc::now();
        q.push(msg(MessageKind::IceCandidate, now), &conf);
        q.push(msg(MessageKind::Offer, now), &conf);
        q.push(msg(MessageKind::Answer, now), &conf);
        q.push(msg(MessageKind::IceCandidate, now), &conf);

        let drained = q.take_up_to(10);
        assert_eq!(drained[0].kind, MessageKind::Offer);
        assert_eq!(drained[1].kind, MessageKind::Answer);
        assert_eq!(drained[2].kind, MessageKind::IceCandidate);
        assert_eq!(drained[3].kind, MessageKind::IceCandidate);
    }

    #[test]
    fn backpressure_drops_only_stale_candidates() {
        let mut q = RoomQueue::default();
        let mut conf = QueueConf::default();
        conf.backpressure_threshold = 2;
        conf.candidate_staleness = StdDuration::from_secs(5).into();

        let stale = Utc::now() - Duration::seconds(10);
        let fresh = Utc::now();

        q.push(msg(MessageKind::Offer, stale), &conf);
        q.push(msg(MessageKind::IceCandidate, stale), &conf);
        q.push(msg(MessageKind::IceCandidate, fresh), &conf);

        let drained = q.take_up_to(10);
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().any(|m| m.kind == MessageKind::Offer));
        assert!(drained
            .iter()
            .any(|m| m.kind == MessageKind::IceCandidate));
    }

    #[test]
    fn take_up_to_respects_batch_size() {
        let mut q = RoomQueue::default();
        let conf = QueueConf::default();
        let now = Utc::now();
        for _ in 0..5 {
            q.push(msg(MessageKind::IceCandidate, now), &conf);
        }
        assert_eq!(q.take_up_to(3).len(), 3);
        assert_eq!(q.take_up_to(10).len(), 2);
        assert!(q.is_empty());
    }
}
