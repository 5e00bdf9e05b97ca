use std::{sync::Arc, time::Duration};

use enclose::enc;
use tokio_util::sync::CancellationToken;
use webrtc::{
    peer_connection::RTCPeerConnection,
    rtp_transceiver::rtp_sender::RTCRtpSender,
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
};

use crate::{
    error::{Error, NegotiationErrorKind},
    routing::RoutingTable,
};

/// Subscriber attaches the forwarding track of another user to a peer connection.
#[derive(Debug)]
pub struct Subscriber {
    pub peer_id: String,
    pub local_track: Arc<TrackLocalStaticRTP>,
    pub rtp_sender: Arc<RTCRtpSender>,
}

impl Subscriber {
    /// Waits for the track published under `peer_id` and adds it to `peer`. This is the only blocking step
    /// of a negotiation.
    pub(crate) async fn attach(
        peer: &RTCPeerConnection,
        peer_id: &str,
        routes: &RoutingTable<Arc<TrackLocalStaticRTP>>,
        wait_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        tracing::debug!("Waiting for the track of peer_id={}", peer_id);
        let local_track = routes.acquire(peer_id, wait_timeout).await?;

        let track: Arc<dyn TrackLocal + Send + Sync> = local_track.clone();
        let rtp_sender = peer.add_track(track).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to add track of {}: {}", peer_id, e),
                NegotiationErrorKind::TrackError,
            )
        })?;
        drain_rtcp(rtp_sender.clone(), cancel);

        tracing::info!("Subscribed to peer_id={}", peer_id);
        Ok(Self {
            peer_id: peer_id.to_owned(),
            local_track,
            rtp_sender,
        })
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        tracing::debug!("Subscriber peer_id={} is dropped", self.peer_id);
    }
}

/// Reads and discards RTCP arriving on `sender` so the interceptors keep processing it.
pub fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    tokio::spawn(enc!((sender) async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                res = sender.read_rtcp() => {
                    if let Err(err) = res {
                        tracing::debug!("RTCP drain has finished: {}", err);
                        break;
                    }
                }
            }
        }
    }));
}
