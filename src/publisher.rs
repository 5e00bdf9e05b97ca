use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use enclose::enc;
use tokio_util::sync::CancellationToken;
use webrtc::{
    peer_connection::RTCPeerConnection,
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use crate::routing::RoutingTable;

/// Forwarding track stream id for tracks relayed by this server.
pub const RELAY_TRACK_ID: &str = "video";

/// Publisher owns the forwarding side of one remote video track: a local track mirroring its codec, a
/// periodic keyframe request, and the relay loop copying packets between them.
#[derive(Debug)]
pub struct Publisher {
    pub user_id: String,
    pub ssrc: u32,
    pub local_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
}

impl Publisher {
    /// Creates the forwarding track for `remote`, hands it to whoever waits on `user_id` and starts relaying.
    /// Everything spawned here stops when `cancel` fires.
    pub(crate) fn start(
        user_id: String,
        remote: Arc<TrackRemote>,
        peer: Weak<RTCPeerConnection>,
        routes: Arc<RoutingTable<Arc<TrackLocalStaticRTP>>>,
        pli_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let ssrc = remote.ssrc();
        let codec = remote.codec();
        tracing::info!(
            "Track published: user_id={}, ssrc={}, mime_type={}",
            user_id,
            ssrc,
            codec.capability.mime_type
        );

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            codec.capability,
            RELAY_TRACK_ID.to_owned(),
            user_id.clone(),
        ));

        tokio::spawn(enc!((cancel) async move {
            Self::pli_loop(peer, ssrc, pli_interval, cancel).await;
        }));

        tokio::spawn(enc!((user_id, local_track, cancel) async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Publisher user_id={} cancelled before being routed", user_id);
                    return;
                }
                res = routes.publish(&user_id, local_track.clone()) => {
                    if let Err(err) = res {
                        tracing::error!("Publisher user_id={} failed to route track: {}", user_id, err);
                        return;
                    }
                }
            }
            // A track nobody claimed must not be handed to the next subscriber once this publisher is gone.
            cancel.cancelled().await;
            if routes
                .withdraw(&user_id, |track| Arc::ptr_eq(track, &local_track))
                .await
            {
                tracing::debug!("Publisher user_id={} withdrew its unclaimed track", user_id);
            }
        }));

        tokio::spawn(enc!((user_id, local_track, cancel) async move {
            Self::relay_loop(user_id, remote, local_track, cancel).await;
        }));

        Arc::new(Self {
            user_id,
            ssrc,
            local_track,
            cancel,
        })
    }

    /// Requests a keyframe from the publisher every `interval`.
    pub(crate) async fn pli_loop(
        peer: Weak<RTCPeerConnection>,
        media_ssrc: u32,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    let Some(peer) = peer.upgrade() else {
                        break;
                    };
                    if let Err(err) = peer
                        .write_rtcp(&[Box::new(PictureLossIndication {
                            sender_ssrc: 0,
                            media_ssrc,
                        })])
                        .await
                    {
                        tracing::warn!("Failed to send PLI ssrc={}: {}", media_ssrc, err);
                    }
                }
            }
        }
        tracing::debug!("PLI loop ssrc={} has finished", media_ssrc);
    }

    async fn relay_loop(
        user_id: String,
        remote: Arc<TrackRemote>,
        local_track: Arc<TrackLocalStaticRTP>,
        cancel: CancellationToken,
    ) {
        let ssrc = remote.ssrc();
        tracing::debug!("Relay loop user_id={} ssrc={} has started", user_id, ssrc);
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                res = remote.read_rtp() => res,
            };
            match res {
                Ok((packet, _attr)) => {
                    tracing::trace!(
                        "Relay user_id={} seq={} timestamp={}",
                        user_id,
                        packet.header.sequence_number,
                        packet.header.timestamp
                    );
                    match local_track.write_rtp(&packet).await {
                        Ok(_) => {}
                        // No subscriber is bound yet.
                        Err(webrtc::Error::ErrClosedPipe) => {}
                        Err(err) => {
                            tracing::error!("Relay user_id={} failed to write rtp: {}", user_id, err);
                            break;
                        }
                    }
                }
                Err(webrtc::Error::ErrClosedPipe) => {
                    break;
                }
                Err(webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                    webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
                ))) => {
                    break;
                }
                Err(err) => {
                    tracing::error!("Relay user_id={} failed to read rtp: {}", user_id, err);
                    break;
                }
            }
        }
        tracing::debug!("Relay loop user_id={} ssrc={} has finished", user_id, ssrc);
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        tracing::debug!("Publisher user_id={} ssrc={} is dropped", self.user_id, self.ssrc);
    }
}
