//! Administrative HTTP surface: out-of-band room lifecycle management.

use actix_web::{
    http::StatusCode, web, web::Data, web::Json, web::Path, HttpResponse,
    ResponseError,
};
use broker_protocol::{PeerId, RoomId, RoomRules};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{GatewayError, GatewayState, RulesUpdate};
use crate::events::SeqGen;

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownRoom | Self::PeerNotFound => StatusCode::NOT_FOUND,
            Self::NotRoomOwner => StatusCode::FORBIDDEN,
            Self::MaxConnections
            | Self::FallbackNotEnabled
            | Self::Room(_) => StatusCode::CONFLICT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message: self.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    #[serde(rename = "ownerId")]
    owner_id: PeerId,
    #[serde(rename = "maxPlayers")]
    max_players: u32,
    #[serde(rename = "allowRelay")]
    allow_relay: bool,
    #[serde(rename = "latencyTargetMs")]
    latency_target_ms: u32,
    #[serde(rename = "opusBitrate")]
    opus_bitrate: u32,
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
    #[serde(rename = "roomId")]
    room_id: RoomId,
}

#[derive(Debug, Serialize)]
struct RoomView {
    #[serde(rename = "roomId")]
    room_id: RoomId,
    #[serde(rename = "ownerId")]
    owner_id: PeerId,
    players: Vec<PeerId>,
    rules: RoomRules,
    active: bool,
}

/// `POST /rooms`. Room identity is assigned here, not supplied by the
/// caller.
pub async fn create_room(
    state: Data<GatewayState>,
    seq: Data<SeqGen>,
    body: Json<CreateRoomRequest>,
) -> Result<HttpResponse, GatewayError> {
    let body = body.into_inner();
    let room_id = RoomId(uuid::Uuid::new_v4().to_string());
    let rules = RoomRules {
        max_players: body.max_players,
        allow_relay: body.allow_relay,
        latency_target_ms: body.latency_target_ms,
        opus_bitrate: body.opus_bitrate,
    };
    state
        .create_room(room_id.clone(), body.owner_id, rules, seq.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(CreateRoomResponse { room_id }))
}

#[derive(Debug, Deserialize)]
struct PatchRulesRequest {
    #[serde(rename = "ownerId")]
    owner_id: PeerId,
    #[serde(rename = "maxPlayers")]
    max_players: Option<u32>,
    #[serde(rename = "allowRelay")]
    allow_relay: Option<bool>,
    #[serde(rename = "latencyTargetMs")]
    latency_target_ms: Option<u32>,
    #[serde(rename = "opusBitrate")]
    opus_bitrate: Option<u32>,
}

/// `PATCH /rooms/:id/rules`.
pub async fn update_room_rules(
    state: Data<GatewayState>,
    room_id: Path<RoomId>,
    body: Json<PatchRulesRequest>,
) -> Result<HttpResponse, GatewayError> {
    let body = body.into_inner();
    state
        .update_room_rules(
            &room_id.into_inner(),
            &body.owner_id,
            RulesUpdate {
                max_players: body.max_players,
                allow_relay: body.allow_relay,
                latency_target_ms: body.latency_target_ms,
                opus_bitrate: body.opus_bitrate,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Debug, Deserialize)]
struct CloseRoomRequest {
    #[serde(rename = "ownerId")]
    owner_id: PeerId,
}

/// `DELETE /rooms/:id`.
pub async fn close_room(
    state: Data<GatewayState>,
    room_id: Path<RoomId>,
    body: Json<CloseRoomRequest>,
) -> Result<HttpResponse, GatewayError> {
    state
        .close_room(&room_id.into_inner(), &body.owner_id)
        .await?;
    Ok(HttpResponse::Ok().finish())
}

/// `GET /rooms/:id`.
pub async fn get_room(
    state: Data<GatewayState>,
    room_id: Path<RoomId>,
) -> Result<HttpResponse, GatewayError> {
    let room = state.get_room(&room_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "room": RoomView {
            room_id: room.id().clone(),
            owner_id: room.owner_id().clone(),
            players: room.members().iter().cloned().collect(),
            rules: *room.rules(),
            active: room.is_active(),
        },
    })))
}
