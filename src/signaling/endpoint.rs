use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{
    call::{Negotiator, PeerInfo},
    error::{DecodeErrorKind, Error},
    signaling::{room::RoomRegistry, session::WsSession},
};

/// Request and response body of the SDP endpoint. `sdp` is base64 encoded JSON of a session description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpBody {
    #[serde(alias = "Sdp")]
    pub sdp: String,
}

#[derive(Debug, Deserialize)]
struct SdpPath {
    meeting_id: String,
    user_id: String,
    peer_id: String,
    is_sender: String,
}

/// `1`, `t` and `true` in any of their usual cases. Anything else is false.
fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

/// HTTP and websocket signaling endpoint handler for [`actix_web`].
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct SignalingEndpoint<N> {
    #[derivative(Debug = "ignore")]
    negotiator: Arc<N>,
    rooms: Arc<RoomRegistry>,
}

impl<N> Clone for SignalingEndpoint<N> {
    fn clone(&self) -> Self {
        Self {
            negotiator: self.negotiator.clone(),
            rooms: self.rooms.clone(),
        }
    }
}

impl<N> SignalingEndpoint<N>
where
    N: Negotiator,
{
    pub fn new(negotiator: Arc<N>, rooms: Arc<RoomRegistry>) -> Self {
        Self { negotiator, rooms }
    }

    /// POST /webrtc/sdp/m/{meeting_id}/c/{user_id}/p/{peer_id}/s/{is_sender}
    async fn handle_offer(&self, path: SdpPath, body: web::Bytes) -> Result<HttpResponse, Error> {
        let body: SdpBody = serde_json::from_slice(&body).map_err(|e| {
            Error::new_decode(
                format!("Invalid request body: {}", e),
                DecodeErrorKind::JsonError,
            )
        })?;
        let info = PeerInfo {
            meeting_id: path.meeting_id,
            user_id: path.user_id,
            peer_id: path.peer_id,
            is_sender: parse_bool(&path.is_sender),
        };
        let answer = self.negotiator.negotiate(&body.sdp, info).await?;
        Ok(HttpResponse::Ok().json(SdpBody { sdp: answer }))
    }
}

impl<N> SignalingEndpoint<N>
where
    N: Negotiator + 'static,
{
    /// Configures the Actix web service with the signaling routes:
    ///- `POST /webrtc/sdp/m/{meeting_id}/c/{user_id}/p/{peer_id}/s/{is_sender}` negotiates a media call.
    ///- `GET /ws/join/{room_id}/c/{user_id}` upgrades to a room websocket.
    pub fn configure(self, cfg: &mut web::ServiceConfig) {
        let endpoint = web::Data::new(self);

        cfg.service(
            web::resource("/webrtc/sdp/m/{meeting_id}/c/{user_id}/p/{peer_id}/s/{is_sender}")
                .route(web::post().to(Self::handle_offer_route)),
        )
        .service(
            web::resource("/ws/join/{room_id}/c/{user_id}")
                .route(web::get().to(Self::handle_join_route)),
        )
        .app_data(endpoint);
    }

    async fn handle_offer_route(
        endpoint: web::Data<Self>,
        path: web::Path<SdpPath>,
        body: web::Bytes,
    ) -> Result<HttpResponse, actix_web::Error> {
        endpoint
            .handle_offer(path.into_inner(), body)
            .await
            .map_err(|e| e.into())
    }

    async fn handle_join_route(
        endpoint: web::Data<Self>,
        path: web::Path<(String, String)>,
        req: HttpRequest,
        stream: web::Payload,
    ) -> Result<HttpResponse, actix_web::Error> {
        let (room_id, user_id) = path.into_inner();
        tracing::info!("user_id={} is joining room_id={}", user_id, room_id);
        ws::start(
            WsSession::new(room_id, user_id, endpoint.rooms.clone()),
            &req,
            stream,
        )
    }
}
