use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use strum_macros::Display;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    DecodeError(#[from] DecodeError),
    #[error(transparent)]
    NegotiationError(#[from] NegotiationError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    RoutingError(#[from] RoutingError),
    #[error(transparent)]
    RoomError(#[from] RoomError),
}

/// Malformed SDP or ICE payloads.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: String,
}

#[derive(Debug, Display, PartialEq, Clone)]
pub enum DecodeErrorKind {
    Base64Error,
    JsonError,
    UnexpectedPayloadError,
}

/// Peer connection or session description failures.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct NegotiationError {
    pub kind: NegotiationErrorKind,
    pub message: String,
}

#[derive(Debug, Display, PartialEq, Clone)]
pub enum NegotiationErrorKind {
    PeerConnectionError,
    RemoteDescriptionError,
    LocalDescriptionError,
    TrackError,
}

/// Signaling socket dial, read or write failures.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Display, PartialEq, Clone)]
pub enum TransportErrorKind {
    InvalidUrlError,
    DialError,
    NotConnectedError,
    ClosedError,
}

#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct RoutingError {
    pub kind: RoutingErrorKind,
    pub message: String,
}

#[derive(Debug, Display, PartialEq, Clone)]
pub enum RoutingErrorKind {
    RoutingTimeoutError,
    SlotClosedError,
}

#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct RoomError {
    pub kind: RoomErrorKind,
    pub message: String,
}

#[derive(Debug, Display, PartialEq, Clone)]
pub enum RoomErrorKind {
    RoomNotFoundError,
    RecipientNotFoundError,
}

impl Error {
    pub fn new_decode(message: String, kind: DecodeErrorKind) -> Error {
        Error::DecodeError(DecodeError { kind, message })
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Error {
        Error::NegotiationError(NegotiationError { kind, message })
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_routing(message: String, kind: RoutingErrorKind) -> Error {
        Error::RoutingError(RoutingError { kind, message })
    }

    pub fn new_room(message: String, kind: RoomErrorKind) -> Error {
        Error::RoomError(RoomError { kind, message })
    }

    pub fn decode_kind(&self) -> Option<&DecodeErrorKind> {
        match self {
            Error::DecodeError(e) => Some(&e.kind),
            _ => None,
        }
    }

    pub fn routing_kind(&self) -> Option<&RoutingErrorKind> {
        match self {
            Error::RoutingError(e) => Some(&e.kind),
            _ => None,
        }
    }

    pub fn room_kind(&self) -> Option<&RoomErrorKind> {
        match self {
            Error::RoomError(e) => Some(&e.kind),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
