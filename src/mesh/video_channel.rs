use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::{media_engine::MIME_TYPE_H264, API},
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTCRtpCodecCapability, rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver,
    },
    track::{
        track_local::{
            track_local_static_rtp::TrackLocalStaticRTP,
            track_local_static_sample::TrackLocalStaticSample, TrackLocal,
        },
        track_remote::TrackRemote,
    },
};

use super::{
    data_channel::DataChannelClient, lock, MeshCore, MeshHandler, PeerState, PeerTransition,
    Signaling,
};
use crate::{
    config::{ClientConfig, MediaConfig},
    error::{Error, NegotiationErrorKind},
    media::{
        frame::{stream_rtp, stream_samples, FramePacer},
        source::MediaSource,
    },
    publisher::Publisher,
    signaling::{
        message::{Channel, SignalBody, SignalMsg, SignalPayload, REQUEST_JOIN_MEDIA_CHANNEL},
        websocket::WebsocketClient,
    },
    subscriber::drain_rtcp,
};

pub const LOCAL_TRACK_ID: &str = "video";
pub const LOCAL_STREAM_ID: &str = "skyrelay";
const RESTART_DELAY: Duration = Duration::from_secs(1);
const REMOTE_TRACK_QUEUE_SIZE: usize = 16;

/// The local video track. RTP sources are passed through, everything else is demuxed into samples.
#[derive(Clone)]
enum LocalVideo {
    Rtp(Arc<TrackLocalStaticRTP>),
    Sample(Arc<TrackLocalStaticSample>),
}

impl LocalVideo {
    fn new(is_rtp: bool) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        };
        if is_rtp {
            LocalVideo::Rtp(Arc::new(TrackLocalStaticRTP::new(
                codec,
                LOCAL_TRACK_ID.to_owned(),
                LOCAL_STREAM_ID.to_owned(),
            )))
        } else {
            LocalVideo::Sample(Arc::new(TrackLocalStaticSample::new(
                codec,
                LOCAL_TRACK_ID.to_owned(),
                LOCAL_STREAM_ID.to_owned(),
            )))
        }
    }

    fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        match self {
            LocalVideo::Rtp(track) => track.clone(),
            LocalVideo::Sample(track) => track.clone(),
        }
    }
}

impl fmt::Debug for LocalVideo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalVideo::Rtp(_) => f.write_str("LocalVideo::Rtp"),
            LocalVideo::Sample(_) => f.write_str("LocalVideo::Sample"),
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
enum VideoEvent {
    Signal(SignalMsg),
    ToggleVideo {
        enable: bool,
        #[derivative(Debug = "ignore")]
        done: oneshot::Sender<()>,
    },
    LocalCandidate {
        peer_id: String,
        candidate: RTCIceCandidateInit,
    },
    StateChanged {
        peer_id: String,
        #[derivative(Debug = "ignore")]
        connection: Weak<RTCPeerConnection>,
        state: RTCPeerConnectionState,
    },
    RemoteTrack {
        peer_id: String,
        #[derivative(Debug = "ignore")]
        connection: Weak<RTCPeerConnection>,
        #[derivative(Debug = "ignore")]
        track: Arc<TrackRemote>,
    },
}

#[derive(Derivative)]
#[derivative(Debug)]
struct VideoInner {
    core: MeshCore,
    is_master: bool,
    #[derivative(Debug = "ignore")]
    api: API,
    #[derivative(Debug = "ignore")]
    configuration: RTCConfiguration,
    pli_interval: Duration,
    source: Arc<dyn MediaSource>,
    websocket: Arc<dyn Signaling>,
    data_channel: Mutex<Option<Arc<DataChannelClient>>>,
    local_video: Mutex<Option<LocalVideo>>,
    video_cancel: Mutex<Option<CancellationToken>>,
    #[derivative(Debug = "ignore")]
    remote_tracks: Mutex<HashMap<String, Vec<Arc<TrackRemote>>>>,
    track_cancels: Mutex<HashMap<String, CancellationToken>>,
    #[derivative(Debug = "ignore")]
    remote_sender: broadcast::Sender<(String, Arc<TrackRemote>)>,
    #[derivative(Debug = "ignore")]
    events: mpsc::UnboundedSender<VideoEvent>,
    cancel: CancellationToken,
}

/// VideoChannelClient exchanges H.264 video with every peer of a room. The master calls each peer
/// that asks to join the media channel. Signaling goes over an open data channel when one is set,
/// and over the websocket otherwise.
#[derive(Debug)]
pub struct VideoChannelClient {
    inner: Arc<VideoInner>,
    websocket: Option<Arc<WebsocketClient>>,
}

impl VideoChannelClient {
    /// Joins the room of `config` on `websocket`. Joining an already connected websocket reuses it.
    pub async fn connect(
        config: &ClientConfig,
        source: Arc<dyn MediaSource>,
        websocket: Arc<WebsocketClient>,
    ) -> Result<Self, Error> {
        let frames = websocket.subscribe();
        websocket
            .connect(&config.room_id, &config.user_id)
            .await?;
        let signaling: Arc<dyn Signaling> = websocket.clone();
        Self::start(config, source, signaling, frames, Some(websocket))
    }

    pub(crate) fn start(
        config: &ClientConfig,
        source: Arc<dyn MediaSource>,
        signaling: Arc<dyn Signaling>,
        frames: mpsc::Receiver<String>,
        websocket: Option<Arc<WebsocketClient>>,
    ) -> Result<Self, Error> {
        let media = MediaConfig::default();
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (remote_sender, _) = broadcast::channel(REMOTE_TRACK_QUEUE_SIZE);
        let inner = Arc::new(VideoInner {
            core: MeshCore::new(
                config.user_id.clone(),
                config.room_id.clone(),
                Channel::Webrtc,
            ),
            is_master: config.is_master,
            api: media.build_api()?,
            configuration: config.transport.configuration.clone(),
            pli_interval: media.pli_interval,
            source,
            websocket: signaling,
            data_channel: Mutex::new(None),
            local_video: Mutex::new(None),
            video_cancel: Mutex::new(None),
            remote_tracks: Mutex::new(HashMap::new()),
            track_cancels: Mutex::new(HashMap::new()),
            remote_sender,
            events,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(enc!((inner) async move {
            inner.run(frames, event_receiver).await;
        }));
        tracing::info!(
            "VideoChannelClient user_id={} room_id={} is_master={} is started",
            config.user_id,
            config.room_id,
            config.is_master
        );

        Ok(Self { inner, websocket })
    }

    /// Prefers `data_channel` for outgoing signals while it has an open channel.
    pub fn set_data_channel(&self, data_channel: Option<Arc<DataChannelClient>>) {
        if data_channel.is_some() {
            tracing::info!("VideoChannelClient signals over the data channel when it is open");
        }
        *lock(&self.inner.data_channel) = data_channel;
    }

    /// Queues an envelope that arrived on another path, such as a data channel. Returns immediately.
    pub fn handle_signal_msg(&self, msg: SignalMsg) {
        if self.inner.events.send(VideoEvent::Signal(msg)).is_err() {
            tracing::warn!("VideoChannelClient is closed, dropping signal");
        }
    }

    /// Starts or stops streaming the media source. The local track is created on first use and added
    /// to every peer connection; later peers get it when they are created. Runs on the client loop, so it
    /// never interleaves with the creation of a peer connection. Returns once the toggle is applied.
    pub async fn toggle_local_video(&self, enable: bool) {
        let (done, applied) = oneshot::channel();
        if self
            .inner
            .events
            .send(VideoEvent::ToggleVideo { enable, done })
            .is_err()
        {
            tracing::warn!("VideoChannelClient is closed, ignoring video toggle");
            return;
        }
        if applied.await.is_err() {
            tracing::debug!("VideoChannelClient closed before applying the video toggle");
        }
    }

    pub fn is_video_enabled(&self) -> bool {
        lock(&self.inner.video_cancel).is_some()
    }

    /// `(peer_id, track)` of every remote track from now on.
    pub fn subscribe_remote_tracks(&self) -> broadcast::Receiver<(String, Arc<TrackRemote>)> {
        self.inner.remote_sender.subscribe()
    }

    pub fn remote_tracks(&self) -> HashMap<String, Vec<Arc<TrackRemote>>> {
        lock(&self.inner.remote_tracks).clone()
    }

    pub fn peer_state(&self, peer_id: &str) -> PeerState {
        self.inner.core.state(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.core.peer_ids()
    }

    /// Stops the video loop, closes the websocket and every peer connection.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.video_cancel).take();
        if let Some(websocket) = &self.websocket {
            websocket.close();
        }
        self.inner.source.stop().await;
        self.inner.core.close_all().await;
        lock(&self.inner.remote_tracks).clear();
        lock(&self.inner.track_cancels).clear();
    }
}

impl Drop for VideoChannelClient {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        tracing::debug!("VideoChannelClient user_id={} is dropped", self.inner.core.user_id);
    }
}

impl VideoInner {
    async fn run(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<String>,
        mut events: mpsc::UnboundedReceiver<VideoEvent>,
    ) {
        let mut frames_open = true;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                frame = frames.recv(), if frames_open => match frame {
                    Some(text) => match SignalMsg::from_json(&text) {
                        Ok(msg) => self.handle_signal(msg).await,
                        Err(err) => tracing::warn!("Ignoring signaling frame: {}", err),
                    },
                    None => {
                        tracing::info!("Signaling of user_id={} has closed", self.core.user_id);
                        frames_open = false;
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("VideoChannelClient loop user_id={} has finished", self.core.user_id);
    }

    async fn handle_signal(&self, msg: SignalMsg) {
        if msg.status == Some(200) {
            if let Ok(SignalBody::Connected(_)) = msg.body() {
                if let Err(err) = self.init_video_call().await {
                    tracing::error!("Failed to request the media channel: {}", err);
                }
                return;
            }
        }
        if msg.channel != Some(Channel::Webrtc) || msg.from == self.core.user_id {
            return;
        }
        let res = match msg.body() {
            Ok(SignalBody::JoinMediaChannel) if self.is_master => {
                self.create_peer(&msg.from, true).await.map(|_| ())
            }
            Ok(SignalBody::Signal(payload)) => self.handle_payload(&msg.from, payload).await,
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::debug!("Ignoring envelope from {}: {}", msg.from, err);
                Ok(())
            }
        };
        if let Err(err) = res {
            tracing::error!("Media signal from {} failed: {}", msg.from, err);
        }
    }

    async fn init_video_call(&self) -> Result<(), Error> {
        if self.is_master {
            return Ok(());
        }
        self.send_signal(self.core.control(REQUEST_JOIN_MEDIA_CHANNEL))
            .await
    }

    async fn handle_event(&self, event: VideoEvent) {
        match event {
            VideoEvent::Signal(msg) => self.handle_signal(msg).await,
            VideoEvent::ToggleVideo { enable, done } => {
                self.toggle_local_video(enable).await;
                let _ = done.send(());
            }
            VideoEvent::LocalCandidate { peer_id, candidate } => {
                let res = match self
                    .core
                    .signal(&peer_id, &SignalPayload::Candidate(candidate))
                {
                    Ok(msg) => self.send_signal(msg).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = res {
                    tracing::warn!("Failed to send candidate to peer_id={}: {}", peer_id, err);
                }
            }
            VideoEvent::StateChanged {
                peer_id,
                connection,
                state,
            } => {
                tracing::info!("Video peer_id={} connection state changed: {}", peer_id, state);
                if !self.core.is_current(&peer_id, &connection) {
                    return;
                }
                match state {
                    RTCPeerConnectionState::Connected => {
                        self.core.transition(&peer_id, PeerTransition::Connected);
                        self.core.flush_candidates(&peer_id).await;
                    }
                    RTCPeerConnectionState::Disconnected => {
                        self.stop_track_handlers(&peer_id);
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        self.stop_track_handlers(&peer_id);
                        self.core.transition(&peer_id, PeerTransition::Closed);
                        lock(&self.remote_tracks).remove(&peer_id);
                        if let Some(connection) = self.core.remove(&peer_id) {
                            if let Err(err) = connection.close().await {
                                tracing::warn!("Failed to close peer_id={}: {}", peer_id, err);
                            }
                        }
                    }
                    _ => {}
                }
            }
            VideoEvent::RemoteTrack {
                peer_id,
                connection,
                track,
            } => {
                if !self.core.is_current(&peer_id, &connection) {
                    return;
                }
                self.start_track_handlers(&peer_id, connection, track);
            }
        }
    }

    /// Keeps a remote track flowing: periodic keyframe requests and a reader that discards packets
    /// nobody consumes.
    fn start_track_handlers(
        &self,
        peer_id: &str,
        connection: Weak<RTCPeerConnection>,
        track: Arc<TrackRemote>,
    ) {
        tracing::info!(
            "Remote track from peer_id={}: ssrc={}, kind={}",
            peer_id,
            track.ssrc(),
            track.kind()
        );
        lock(&self.remote_tracks)
            .entry(peer_id.to_owned())
            .or_default()
            .push(track.clone());
        let cancel = lock(&self.track_cancels)
            .entry(peer_id.to_owned())
            .or_insert_with(|| self.cancel.child_token())
            .clone();

        tokio::spawn(Publisher::pli_loop(
            connection,
            track.ssrc(),
            self.pli_interval,
            cancel.clone(),
        ));
        tokio::spawn(enc!((track) async move {
            drain_remote(track, cancel).await;
        }));

        // No subscriber is not an error.
        let _ = self.remote_sender.send((peer_id.to_owned(), track));
    }

    fn stop_track_handlers(&self, peer_id: &str) {
        if let Some(cancel) = lock(&self.track_cancels).remove(peer_id) {
            cancel.cancel();
        }
    }

    async fn add_local_track(&self, peer_id: &str, connection: &RTCPeerConnection, video: &LocalVideo) {
        match connection.add_track(video.track()).await {
            Ok(sender) => drain_rtcp(sender, self.cancel.child_token()),
            Err(err) => {
                tracing::warn!("Failed to add local video to peer_id={}: {}", peer_id, err);
            }
        }
    }

    async fn toggle_local_video(&self, enable: bool) {
        if !enable {
            if let Some(cancel) = lock(&self.video_cancel).take() {
                tracing::info!("Local video is disabled");
                cancel.cancel();
            }
            return;
        }

        let cancel = {
            let mut video_cancel = lock(&self.video_cancel);
            if video_cancel.is_some() {
                return;
            }
            let cancel = self.cancel.child_token();
            *video_cancel = Some(cancel.clone());
            cancel
        };

        let (video, created) = self.local_video();
        if created {
            for (peer_id, connection) in self.core.connections() {
                self.add_local_track(&peer_id, &connection, &video).await;
            }
        }

        tracing::info!("Local video is enabled: {:?}", video);
        tokio::spawn(stream_video(self.source.clone(), video, cancel));
    }

    /// The local track, and whether this call created it.
    fn local_video(&self) -> (LocalVideo, bool) {
        let mut local_video = lock(&self.local_video);
        match local_video.as_ref() {
            Some(video) => (video.clone(), false),
            None => {
                let video = LocalVideo::new(self.source.is_rtp());
                *local_video = Some(video.clone());
                (video, true)
            }
        }
    }

    fn register_hooks(&self, peer_id: &str, connection: &Arc<RTCPeerConnection>) {
        let peer_id = peer_id.to_owned();
        let events = self.events.clone();
        let weak = Arc::downgrade(connection);

        connection.on_ice_candidate(Box::new(enc!((events, peer_id) move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(candidate) => {
                        let _ = events.send(VideoEvent::LocalCandidate {
                            peer_id: peer_id.clone(),
                            candidate,
                        });
                    }
                    Err(err) => tracing::warn!("Failed to serialize candidate: {}", err),
                }
            }
            Box::pin(async {})
        })));

        connection.on_track(Box::new(enc!((events, peer_id, weak) move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = events.send(VideoEvent::RemoteTrack {
                peer_id: peer_id.clone(),
                connection: weak.clone(),
                track,
            });
            Box::pin(async {})
        })));

        connection.on_peer_connection_state_change(Box::new(enc!((events, peer_id, weak) move |state: RTCPeerConnectionState| {
            let _ = events.send(VideoEvent::StateChanged {
                peer_id: peer_id.clone(),
                connection: weak.clone(),
                state,
            });
            Box::pin(async {})
        })));
    }
}

#[async_trait]
impl Signaling for VideoInner {
    async fn send_signal(&self, msg: SignalMsg) -> Result<(), Error> {
        let data_channel = lock(&self.data_channel).clone();
        if let Some(data_channel) = data_channel {
            if data_channel.has_open_channel() {
                match data_channel.send_signal(msg.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        tracing::debug!("Data channel signaling failed, using websocket: {}", err);
                    }
                }
            }
        }
        self.websocket.send_signal(msg).await
    }
}

#[async_trait]
impl MeshHandler for VideoInner {
    fn core(&self) -> &MeshCore {
        &self.core
    }

    fn signaling(&self) -> &dyn Signaling {
        self
    }

    async fn create_peer(
        &self,
        peer_id: &str,
        is_caller: bool,
    ) -> Result<Arc<RTCPeerConnection>, Error> {
        tracing::info!("Setting up video connection for peer_id={}", peer_id);
        let connection = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await
                .map_err(|e| {
                    Error::new_negotiation(
                        format!("Failed to create peer connection: {}", e),
                        NegotiationErrorKind::PeerConnectionError,
                    )
                })?,
        );
        // An offer needs a media section, so a caller creates the track even before streaming starts.
        let video = if is_caller {
            Some(self.local_video().0)
        } else {
            lock(&self.local_video).clone()
        };
        if let Some(video) = video {
            self.add_local_track(peer_id, &connection, &video).await;
        }
        self.register_hooks(peer_id, &connection);

        if let Some(old) = self.core.insert(peer_id, connection.clone()) {
            tracing::info!("Replacing video connection of peer_id={}", peer_id);
            self.stop_track_handlers(peer_id);
            lock(&self.remote_tracks).remove(peer_id);
            tokio::spawn(async move {
                let _ = old.close().await;
            });
        }

        if is_caller {
            self.core.send_offer(peer_id, &connection, self).await?;
        }
        Ok(connection)
    }
}

/// Streams the source into `video` until `cancel` fires, restarting the source whenever it ends.
async fn stream_video(source: Arc<dyn MediaSource>, video: LocalVideo, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        if let Err(err) = stream_once(source.as_ref(), &video, cancel.clone()).await {
            tracing::warn!("Local video stream failed: {}", err);
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
    tracing::debug!("Local video loop has finished");
}

async fn stream_once(
    source: &dyn MediaSource,
    video: &LocalVideo,
    cancel: CancellationToken,
) -> Result<(), Error> {
    source.start().await?;
    let reader = source.reader().await?;
    match video {
        LocalVideo::Rtp(track) => stream_rtp(reader, track.as_ref(), cancel).await,
        LocalVideo::Sample(track) => {
            let pacer = FramePacer::default().realtime(!source.is_live());
            stream_samples(reader, track.as_ref(), pacer, cancel).await
        }
    }
}

async fn drain_remote(track: Arc<TrackRemote>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            res = track.read_rtp() => {
                if let Err(err) = res {
                    tracing::debug!("Remote track ssrc={} has ended: {}", track.ssrc(), err);
                    break;
                }
            }
        }
    }
}
