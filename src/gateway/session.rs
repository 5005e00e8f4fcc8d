//! Per-peer WebSocket session actor: the signaling ingress/egress endpoint.

use std::time::Duration;

use actix::prelude::*;
use actix_web::{
    web::{Data, Payload, Query},
    Error, HttpRequest, HttpResponse,
};
use actix_web_actors::ws;
use broker_protocol::{
    ClientEvent, ClientEventHandler, ConnectionState, PeerId, RoomId, ServerEvent,
};
use serde::Deserialize;
use serde_json::Value;

use super::{GatewayState, ToClient};
use crate::{prelude::*, queue::MessageKind};

const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct HandshakeQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
    #[serde(rename = "peerId")]
    peer_id: Option<String>,
}

/// Handles the HTTP upgrade, admitting the socket only if both `roomId` and
/// `peerId` are present in the query string (§4.6, §6.1).
///
/// # Errors
///
/// Errors if the WebSocket handshake fails for any underlying reason.
pub async fn create_ws(
    request: HttpRequest,
    payload: Payload,
    state: Data<GatewayState>,
) -> Result<HttpResponse, Error> {
    let query = Query::<HandshakeQuery>::from_query(request.query_string())
        .map(Query::into_inner)
        .unwrap_or(HandshakeQuery {
            room_id: None,
            peer_id: None,
        });

    let (room_id, peer_id) = match (query.room_id, query.peer_id) {
        (Some(r), Some(p)) if !r.is_empty() && !p.is_empty() => {
            (RoomId(r), PeerId(p))
        }
        _ => {
            return Ok(HttpResponse::BadRequest()
                .body("roomId and peerId query parameters are required"))
        }
    };

    ws::start(WsSession::new(room_id, peer_id, state), &request, payload)
}

/// One connected client socket. A peer may hold several concurrent sessions
/// (reconnect handoff); only the last one closing triggers `leave`.
pub struct WsSession {
    room_id: RoomId,
    peer_id: PeerId,
    state: Data<GatewayState>,
    last_ping: u32,
}

impl WsSession {
    fn new(room_id: RoomId, peer_id: PeerId, state: Data<GatewayState>) -> Self {
        Self {
            room_id,
            peer_id,
            state,
            last_ping: 0,
        }
    }

    fn send_error(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        code: Option<&'static str>,
        message: String,
    ) {
        let event = ServerEvent::Error {
            code: code.map(str::to_owned),
            message,
        };
        if let Ok(json) = serde_json::to_string(&event) {
            ctx.text(json);
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(self.state.log, "Failed to parse client event"; "error" => %e);
                self.send_error(ctx, None, "malformed message".into());
                return;
            }
        };

        let mut collector = ActionCollector(None);
        event.dispatch_with(&mut collector);
        match collector.0 {
            Some(action) => self.run_action(action, ctx),
            None => {}
        }
    }

    fn run_action(&mut self, action: Action, ctx: &mut ws::WebsocketContext<Self>) {
        let state = Data::clone(&self.state);
        let room_id = self.room_id.clone();
        let peer_id = self.peer_id.clone();

        match action {
            Action::Join => {
                let fut = async move { state.join(&room_id, &peer_id).await };
                ctx.spawn(actix::fut::wrap_future(fut).map(
                    |res, act: &mut Self, ctx| {
                        if let Err(e) = res {
                            act.send_error(ctx, e.code(), e.to_string());
                        }
                    },
                ));
            }
            Action::Leave => {
                let fut = async move { state.leave(&room_id, &peer_id).await };
                ctx.spawn(actix::fut::wrap_future(fut).map(
                    |res, act: &mut Self, ctx| {
                        if let Err(e) = res {
                            act.send_error(ctx, e.code(), e.to_string());
                        }
                    },
                ));
            }
            Action::Offer { to, payload } => {
                ctx.spawn(actix::fut::wrap_future(async move {
                    state
                        .forward_signaling(MessageKind::Offer, room_id, peer_id, to, payload)
                        .await;
                }));
            }
            Action::Answer { to, payload } => {
                ctx.spawn(actix::fut::wrap_future(async move {
                    state
                        .forward_signaling(MessageKind::Answer, room_id, peer_id, to, payload)
                        .await;
                }));
            }
            Action::IceCandidate { to, payload } => {
                ctx.spawn(actix::fut::wrap_future(async move {
                    state
                        .forward_signaling(
                            MessageKind::IceCandidate,
                            room_id,
                            peer_id,
                            to,
                            payload,
                        )
                        .await;
                }));
            }
            Action::ReconnectRequest { to } => {
                let fut =
                    async move { state.reconnect_request(&room_id, peer_id, to).await };
                ctx.spawn(actix::fut::wrap_future(fut).map(
                    |res, act: &mut Self, ctx| {
                        if let Err(e) = res {
                            act.send_error(ctx, e.code(), e.to_string());
                        }
                    },
                ));
            }
            Action::ConnectionStateReport { state: new_state } => {
                ctx.spawn(actix::fut::wrap_future(async move {
                    state
                        .connection_state_report(room_id, peer_id, new_state)
                        .await;
                }));
            }
            Action::FallbackActivate { to } => {
                let fut =
                    async move { state.activate_fallback(&room_id, peer_id, to).await };
                ctx.spawn(actix::fut::wrap_future(fut).map(
                    |res, act: &mut Self, ctx| {
                        if let Err(e) = res {
                            act.send_error(ctx, e.code(), e.to_string());
                        }
                    },
                ));
            }
            Action::RelayData { to, payload } => {
                let fut = async move { state.relay_data(peer_id, to, payload).await };
                ctx.spawn(actix::fut::wrap_future(fut).map(
                    |res, act: &mut Self, ctx| {
                        if let Err(e) = res {
                            act.send_error(ctx, e.code(), e.to_string());
                        }
                    },
                ));
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let socket = ctx.address().recipient();
        self.state.register_socket(self.peer_id.clone(), socket);

        ctx.run_interval(PING_INTERVAL, |this, ctx| {
            this.last_ping += 1;
            ctx.ping(&this.last_ping.to_be_bytes());
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        let socket = ctx.address().recipient();
        let was_last_socket = self.state.deregister_socket(&self.peer_id, &socket);
        if !was_last_socket {
            return;
        }

        let state = Data::clone(&self.state);
        let room_id = self.room_id.clone();
        let peer_id = self.peer_id.clone();
        actix::spawn(async move {
            state
                .connection_state_report(
                    room_id.clone(),
                    peer_id.clone(),
                    ConnectionState::Disconnected,
                )
                .await;
            let _ = state.leave(&room_id, &peer_id).await;
        });
    }
}

impl Handler<ToClient> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: ToClient, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg.0) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(self.state.log, "Failed to serialize outgoing event"; "error" => %e),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(
        &mut self,
        msg: Result<ws::Message, ws::ProtocolError>,
        ctx: &mut Self::Context,
    ) {
        match msg {
            Ok(ws::Message::Ping(p)) => ctx.pong(&p),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(other) => {
                warn!(self.state.log, "Unsupported WebSocket frame"; "frame" => ?other);
            }
            Err(e) => {
                error!(self.state.log, "WebSocket protocol error"; "error" => %e);
            }
        }
    }
}

/// One parsed client action, collected synchronously from a [`ClientEvent`]
/// via [`ClientEventHandler::dispatch_with`] and then driven asynchronously.
enum Action {
    Join,
    Leave,
    Offer { to: PeerId, payload: Value },
    Answer { to: PeerId, payload: Value },
    IceCandidate { to: PeerId, payload: Value },
    ReconnectRequest { to: PeerId },
    ConnectionStateReport { state: ConnectionState },
    FallbackActivate { to: PeerId },
    RelayData { to: PeerId, payload: Value },
}

struct ActionCollector(Option<Action>);

impl ClientEventHandler for ActionCollector {
    fn on_join(&mut self, _room_id: RoomId, _peer_id: PeerId) {
        self.0 = Some(Action::Join);
    }

    fn on_leave(&mut self, _room_id: RoomId, _peer_id: PeerId) {
        self.0 = Some(Action::Leave);
    }

    fn on_offer(&mut self, _room_id: RoomId, _from: PeerId, to: PeerId, offer: Value) {
        self.0 = Some(Action::Offer { to, payload: offer });
    }

    fn on_answer(&mut self, _room_id: RoomId, _from: PeerId, to: PeerId, answer: Value) {
        self.0 = Some(Action::Answer {
            to,
            payload: answer,
        });
    }

    fn on_ice_candidate(
        &mut self,
        _room_id: RoomId,
        _from: PeerId,
        to: PeerId,
        candidate: Value,
    ) {
        self.0 = Some(Action::IceCandidate {
            to,
            payload: candidate,
        });
    }

    fn on_reconnect_request(&mut self, _room_id: RoomId, _from: PeerId, to: PeerId) {
        self.0 = Some(Action::ReconnectRequest { to });
    }

    fn on_connection_state_report(
        &mut self,
        _room_id: RoomId,
        _peer_id: PeerId,
        state: ConnectionState,
    ) {
        self.0 = Some(Action::ConnectionStateReport { state });
    }

    fn on_webrtc_fallback_activate(&mut self, _room_id: RoomId, _from: PeerId, to: PeerId) {
        self.0 = Some(Action::FallbackActivate { to });
    }

    fn on_relay_data(&mut self, _room_id: RoomId, _from: PeerId, to: PeerId, payload: Value) {
        self.0 = Some(Action::RelayData { to, payload });
    }
}
