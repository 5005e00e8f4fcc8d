//! Real-time collaboration signaling broker.
//!
//! Rooms are the membership boundary, peer-connections are the pairwise
//! WebRTC signaling state, and the gateway is the only thing a client ever
//! talks to. See [`gateway`] for the WebSocket/HTTP surface, [`room`] and
//! [`peer_connection`] for the two aggregates, [`queue`] for the prioritized
//! signaling message queue, and [`connection`] for the health tracker that
//! drives reconnection and fallback decisions.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::private_intra_doc_links)]
#![forbid(non_ascii_idents)]

pub mod conf;
pub mod connection;
pub mod events;
pub mod gateway;
pub mod peer_connection;
pub mod prelude;
pub mod queue;
pub mod room;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use actix::Actor;
use actix_web::{web, App, HttpServer};
use slog::o;

use self::{
    conf::Conf,
    connection::ConnectionServiceActor,
    events::{Publisher, SeqGen},
    gateway::{
        http, session, BatchProcessor, GatewayState, ReconnectNotifier,
        RoomStatsMonitor,
    },
    peer_connection::repo::InMemoryPeerConnectionRepository,
    prelude::*,
    queue::QueueActor,
    room::repo::InMemoryRoomRepository,
};

/// Everything a bound gateway needs: the shared state plus the sequence
/// generator the admin HTTP surface allocates `RoomCreated` events from.
pub struct Wired {
    pub state: Arc<GatewayState>,
    pub seq: Arc<SeqGen>,
}

/// Constructs every component and wires the cross-component references.
///
/// Construction order matters: `GatewayState` needs `connection_service`'s
/// `Addr` and `ConnectionServiceActor` needs a recipient that notifies the
/// gateway's socket map, so the socket map itself is built first and shared
/// by both rather than either side waiting on the other's fully-built state.
#[must_use]
pub fn wire(conf: Conf, log: slog::Logger) -> Wired {
    let seq = Arc::new(SeqGen::default());
    let room_repo = Arc::new(InMemoryRoomRepository::new(Arc::clone(&seq)));
    let peer_repo =
        Arc::new(InMemoryPeerConnectionRepository::new(Arc::clone(&seq)));
    let publisher = Arc::new(Publisher::new(log.clone()));
    let sockets = Arc::new(StdMutex::new(HashMap::new()));

    let reconnect_notifier = ReconnectNotifier(Arc::clone(&sockets)).start();
    let connection_service = ConnectionServiceActor::new(
        conf.connection.clone(),
        Arc::clone(&peer_repo),
        Arc::clone(&publisher),
        reconnect_notifier.recipient(),
        log.new(o!("actor" => "connection_service")),
    )
    .start();

    let batch_processor = BatchProcessor::new(
        Arc::clone(&peer_repo),
        Arc::clone(&publisher),
        log.new(o!("actor" => "batch_processor")),
    )
    .start();
    let queue = QueueActor::new(
        conf.queue.clone(),
        batch_processor.recipient(),
        log.new(o!("actor" => "queue")),
    )
    .start();

    let state = Arc::new(GatewayState::new(
        Arc::clone(&room_repo),
        Arc::clone(&peer_repo),
        Arc::clone(&publisher),
        queue,
        connection_service,
        sockets,
        conf.server.clone(),
        log.new(o!("actor" => "gateway")),
    ));

    RoomStatsMonitor::new(
        room_repo,
        state.room_stats_handle(),
        *conf.server.room_stats_monitor_interval,
        log.new(o!("actor" => "room_stats_monitor")),
    )
    .start();

    Wired { state, seq }
}

/// Serves the gateway's WebSocket and admin HTTP surfaces until the process
/// is signaled to stop.
///
/// # Errors
///
/// Errors if the gateway fails to bind its configured address.
pub async fn run(conf: Conf, log: slog::Logger) -> std::io::Result<()> {
    let bind_addr = (conf.server.bind_ip.clone(), conf.server.ws_port);
    let ws_path = conf.server.ws_path.clone();

    info!(log, "Starting gateway"; "addr" => format!("{}:{}", bind_addr.0, bind_addr.1));

    let Wired { state, seq } = wire(conf, log);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(Arc::clone(&state)))
            .app_data(web::Data::from(Arc::clone(&seq)))
            .route(&ws_path, web::get().to(session::create_ws))
            .service(web::resource("/rooms").route(web::post().to(http::create_room)))
            .service(
                web::resource("/rooms/{id}")
                    .route(web::get().to(http::get_room))
                    .route(web::delete().to(http::close_room)),
            )
            .service(
                web::resource("/rooms/{id}/rules")
                    .route(web::patch().to(http::update_room_rules)),
            )
    })
    .bind(bind_addr)?
    .run()
    .await
}
