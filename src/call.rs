use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    api::API,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::{track_local::track_local_static_rtp::TrackLocalStaticRTP, track_remote::TrackRemote},
};

use crate::{
    config::{MediaConfig, RoutingConfig, ServerConfig, WebRTCTransportConfig},
    error::{DecodeErrorKind, Error, NegotiationErrorKind},
    publisher::Publisher,
    routing::RoutingTable,
    signaling::message,
    subscriber::Subscriber,
};

const GATHERING_TIMEOUT: Duration = Duration::from_secs(5);

/// Who is calling, and whether they publish their own video or subscribe to `peer_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub meeting_id: String,
    pub user_id: String,
    pub peer_id: String,
    pub is_sender: bool,
}

/// Turns an encoded SDP offer into an encoded SDP answer.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, offer: &str, info: PeerInfo) -> Result<String, Error>;
}

#[derive(Debug)]
enum CallEvent {
    TrackPublished(Arc<TrackRemote>),
    StateChanged(RTCPeerConnectionState),
}

/// One negotiated peer connection.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Call {
    pub id: String,
    pub info: PeerInfo,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
    publishers: Mutex<Vec<Arc<Publisher>>>,
    subscriber: Mutex<Option<Subscriber>>,
}

impl Call {
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.cancel.cancel();
        for publisher in self.publishers.lock().await.drain(..) {
            publisher.close();
        }
        self.subscriber.lock().await.take();
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        tracing::debug!("Call id={} user_id={} is dropped", self.id, self.info.user_id);
    }
}

/// CallOrchestrator negotiates media calls. Senders publish their track under their own user id,
/// receivers wait on the routing slot of the peer they asked for.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CallOrchestrator {
    #[derivative(Debug = "ignore")]
    api: API,
    media: MediaConfig,
    transport: WebRTCTransportConfig,
    routing: RoutingConfig,
    routes: Arc<RoutingTable<Arc<TrackLocalStaticRTP>>>,
    calls: Arc<Mutex<HashMap<String, Arc<Call>>>>,
}

impl CallOrchestrator {
    pub fn new(config: &ServerConfig) -> Result<Self, Error> {
        Ok(Self {
            api: config.media.build_api()?,
            media: config.media.clone(),
            transport: config.transport.clone(),
            routing: config.routing.clone(),
            routes: Arc::new(RoutingTable::new()),
            calls: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn routes(&self) -> Arc<RoutingTable<Arc<TrackLocalStaticRTP>>> {
        self.routes.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Decodes `offer_b64`, negotiates a peer connection for `info` and returns the encoded answer.
    pub async fn negotiate(&self, offer_b64: &str, info: PeerInfo) -> Result<String, Error> {
        let offer: RTCSessionDescription = message::decode(offer_b64)?;
        if offer.sdp_type != RTCSdpType::Offer {
            return Err(Error::new_decode(
                format!("Expected an offer, got {}", offer.sdp_type),
                DecodeErrorKind::UnexpectedPayloadError,
            ));
        }

        let peer_connection = self
            .api
            .new_peer_connection(self.transport.configuration.clone())
            .await
            .map_err(|e| {
                Error::new_negotiation(
                    format!("Failed to create peer connection: {}", e),
                    NegotiationErrorKind::PeerConnectionError,
                )
            })?;

        let call = Arc::new(Call {
            id: Uuid::new_v4().to_string(),
            info: info.clone(),
            peer_connection: Arc::new(peer_connection),
            cancel: CancellationToken::new(),
            publishers: Mutex::new(Vec::new()),
            subscriber: Mutex::new(None),
        });
        tracing::debug!(
            "Call id={} is created: user_id={}, peer_id={}, is_sender={}",
            call.id,
            info.user_id,
            info.peer_id,
            info.is_sender
        );

        // Tracked before the loop starts, so the loop's removal always comes after the insert.
        self.calls.lock().await.insert(call.id.clone(), call.clone());

        let (event_sender, event_receiver) = mpsc::unbounded_channel::<CallEvent>();
        self.register_hooks(&call, event_sender);
        let calls = self.calls.clone();
        let routes = self.routes.clone();
        let pli_interval = self.media.pli_interval;
        tokio::spawn(enc!((call) async move {
            Self::call_event_loop(call, event_receiver, calls, routes, pli_interval).await;
        }));

        match self.answer(&call, offer).await {
            Ok(answer) => message::encode(&answer),
            Err(err) => {
                tracing::error!("Call id={} negotiation failed: {}", call.id, err);
                self.calls.lock().await.remove(&call.id);
                if let Err(close_err) = call.close().await {
                    tracing::error!("Failed to close call id={}: {}", call.id, close_err);
                }
                Err(err)
            }
        }
    }

    async fn answer(
        &self,
        call: &Call,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        let peer = &call.peer_connection;
        if call.info.is_sender {
            peer.add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::new_negotiation(
                    format!("Failed to add video transceiver: {}", e),
                    NegotiationErrorKind::TrackError,
                )
            })?;
        } else {
            let subscriber = Subscriber::attach(
                peer,
                &call.info.peer_id,
                &self.routes,
                self.routing.wait_timeout,
                call.cancel.clone(),
            )
            .await?;
            *call.subscriber.lock().await = Some(subscriber);
        }

        peer.set_remote_description(offer).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to set remote description: {}", e),
                NegotiationErrorKind::RemoteDescriptionError,
            )
        })?;

        let answer = peer.create_answer(None).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to create answer: {}", e),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })?;
        // The answer goes back over plain HTTP, so it has to carry every local candidate.
        let mut gathering_complete = peer.gathering_complete_promise().await;
        peer.set_local_description(answer).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to set local description: {}", e),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })?;
        if tokio::time::timeout(GATHERING_TIMEOUT, gathering_complete.recv())
            .await
            .is_err()
        {
            tracing::warn!("Call id={} ICE gathering did not complete in time", call.id);
        }

        peer.local_description().await.ok_or_else(|| {
            Error::new_negotiation(
                "Failed to set local description".to_string(),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })
    }

    fn register_hooks(&self, call: &Call, event_sender: mpsc::UnboundedSender<CallEvent>) {
        let peer = &call.peer_connection;

        peer.on_track(Box::new(enc!((event_sender) move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = event_sender.send(CallEvent::TrackPublished(track));
            Box::pin(async {})
        })));

        peer.on_peer_connection_state_change(Box::new(enc!((event_sender) move |state: RTCPeerConnectionState| {
            let _ = event_sender.send(CallEvent::StateChanged(state));
            Box::pin(async {})
        })));

        let call_id = call.id.clone();
        peer.on_ice_gathering_state_change(Box::new(move |state| {
            tracing::debug!("Call id={} ICE gathering state changed: {}", call_id, state);
            Box::pin(async {})
        }));
    }

    async fn call_event_loop(
        call: Arc<Call>,
        mut event_receiver: mpsc::UnboundedReceiver<CallEvent>,
        calls: Arc<Mutex<HashMap<String, Arc<Call>>>>,
        routes: Arc<RoutingTable<Arc<TrackLocalStaticRTP>>>,
        pli_interval: Duration,
    ) {
        loop {
            let event = tokio::select! {
                _ = call.cancel.cancelled() => {
                    break;
                }
                event = event_receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                CallEvent::TrackPublished(track) => {
                    let publisher = Publisher::start(
                        call.info.user_id.clone(),
                        track,
                        Arc::downgrade(&call.peer_connection),
                        routes.clone(),
                        pli_interval,
                        call.cancel.child_token(),
                    );
                    call.publishers.lock().await.push(publisher);
                }
                CallEvent::StateChanged(state) => {
                    tracing::info!("Call id={} connection state changed: {}", call.id, state);
                    match state {
                        RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed => break,
                        _ => {}
                    }
                }
            }
        }

        calls.lock().await.remove(&call.id);
        if let Err(err) = call.close().await {
            tracing::error!("Failed to close call id={}: {}", call.id, err);
        }
        tracing::debug!("Call id={} event loop has finished", call.id);
    }

    /// Closes every live call.
    pub async fn close_all(&self) {
        let calls: Vec<Arc<Call>> = self.calls.lock().await.drain().map(|(_, c)| c).collect();
        for call in calls {
            if let Err(err) = call.close().await {
                tracing::error!("Failed to close call id={}: {}", call.id, err);
            }
        }
    }
}

#[async_trait]
impl Negotiator for CallOrchestrator {
    async fn negotiate(&self, offer: &str, info: PeerInfo) -> Result<String, Error> {
        CallOrchestrator::negotiate(self, offer, info).await
    }
}
