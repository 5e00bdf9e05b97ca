use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::API,
    data_channel::{
        data_channel_message::DataChannelMessage, data_channel_state::RTCDataChannelState,
        RTCDataChannel,
    },
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

use super::{lock, MeshCore, MeshHandler, PeerState, PeerTransition, Signaling};
use crate::{
    config::{ClientConfig, MediaConfig},
    error::{Error, NegotiationErrorKind, TransportErrorKind},
    signaling::{
        message::{Channel, SignalBody, SignalMsg, SignalPayload, REQUEST_JOIN_DATA_CHANNEL},
        websocket::WebsocketClient,
    },
};

pub const DATA_CHANNEL_LABEL: &str = "chat";
const MESSAGE_QUEUE_SIZE: usize = 1024;

#[derive(Derivative)]
#[derivative(Debug)]
enum DataEvent {
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
    ChannelReady {
        peer_id: String,
        #[derivative(Debug = "ignore")]
        channel: Arc<RTCDataChannel>,
    },
}

#[derive(Derivative)]
#[derivative(Debug)]
struct DataChannelInner {
    core: MeshCore,
    is_master: bool,
    #[derivative(Debug = "ignore")]
    api: API,
    #[derivative(Debug = "ignore")]
    configuration: RTCConfiguration,
    signaling: Arc<dyn Signaling>,
    #[derivative(Debug = "ignore")]
    channels: Mutex<HashMap<String, Arc<RTCDataChannel>>>,
    #[derivative(Debug = "ignore")]
    messages: broadcast::Sender<(String, String)>,
    #[derivative(Debug = "ignore")]
    events: mpsc::UnboundedSender<DataEvent>,
}

/// DataChannelClient opens a data channel to every peer of a room. The master offers to each peer
/// that asks to join; other peers ask as soon as their websocket joins the room.
#[derive(Debug)]
pub struct DataChannelClient {
    inner: Arc<DataChannelInner>,
    websocket: Option<Arc<WebsocketClient>>,
    cancel: CancellationToken,
}

impl DataChannelClient {
    /// Joins the room of `config` on `websocket` and starts handling `dt` negotiations.
    pub async fn connect(
        config: &ClientConfig,
        websocket: Arc<WebsocketClient>,
    ) -> Result<Self, Error> {
        let frames = websocket.subscribe();
        websocket
            .connect(&config.room_id, &config.user_id)
            .await?;
        let signaling: Arc<dyn Signaling> = websocket.clone();
        Self::start(config, signaling, frames, Some(websocket))
    }

    pub(crate) fn start(
        config: &ClientConfig,
        signaling: Arc<dyn Signaling>,
        frames: mpsc::Receiver<String>,
        websocket: Option<Arc<WebsocketClient>>,
    ) -> Result<Self, Error> {
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (messages, _) = broadcast::channel(MESSAGE_QUEUE_SIZE);
        let inner = Arc::new(DataChannelInner {
            core: MeshCore::new(
                config.user_id.clone(),
                config.room_id.clone(),
                Channel::DataRtc,
            ),
            is_master: config.is_master,
            api: MediaConfig::default().build_api()?,
            configuration: config.transport.configuration.clone(),
            signaling,
            channels: Mutex::new(HashMap::new()),
            messages,
            events,
        });

        let cancel = CancellationToken::new();
        tokio::spawn(enc!((inner, cancel) async move {
            inner.run(frames, event_receiver, cancel).await;
        }));
        tracing::info!(
            "DataChannelClient user_id={} room_id={} is_master={} is started",
            config.user_id,
            config.room_id,
            config.is_master
        );

        Ok(Self {
            inner,
            websocket,
            cancel,
        })
    }

    /// `(peer_id, text)` of every message arriving on any data channel.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<(String, String)> {
        self.inner.messages.subscribe()
    }

    /// Sends `text` to every open data channel and returns how many accepted it.
    pub async fn send_msg(&self, text: &str) -> usize {
        let channels: Vec<(String, Arc<RTCDataChannel>)> = self
            .inner
            .channels()
            .iter()
            .map(|(id, channel)| (id.clone(), channel.clone()))
            .collect();
        let mut delivered = 0;
        for (peer_id, channel) in channels {
            if channel.ready_state() != RTCDataChannelState::Open {
                continue;
            }
            match channel.send_text(text.to_owned()).await {
                Ok(_) => delivered += 1,
                Err(err) => tracing::warn!("Failed to send to peer_id={}: {}", peer_id, err),
            }
        }
        delivered
    }

    pub fn has_open_channel(&self) -> bool {
        self.inner
            .channels()
            .values()
            .any(|channel| channel.ready_state() == RTCDataChannelState::Open)
    }

    pub fn peer_state(&self, peer_id: &str) -> PeerState {
        self.inner.core.state(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.core.peer_ids()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.core.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.inner.core.room_id
    }

    pub fn is_master(&self) -> bool {
        self.inner.is_master
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(websocket) = &self.websocket {
            websocket.close();
        }
        self.inner.channels().clear();
        self.inner.core.close_all().await;
    }
}

#[async_trait]
impl Signaling for DataChannelClient {
    /// Broadcasts the envelope over the open data channels. Fails when none is open.
    async fn send_signal(&self, msg: SignalMsg) -> Result<(), Error> {
        let text = msg.to_json()?;
        if self.send_msg(&text).await == 0 {
            return Err(Error::new_transport(
                "No open data channel".to_string(),
                TransportErrorKind::NotConnectedError,
            ));
        }
        Ok(())
    }
}

impl Drop for DataChannelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!("DataChannelClient user_id={} is dropped", self.inner.core.user_id);
    }
}

impl DataChannelInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<RTCDataChannel>>> {
        lock(&self.channels)
    }

    async fn run(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<String>,
        mut events: mpsc::UnboundedReceiver<DataEvent>,
        cancel: CancellationToken,
    ) {
        let mut frames_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                frame = frames.recv(), if frames_open => match frame {
                    Some(text) => self.handle_frame(&text).await,
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
        tracing::debug!("DataChannelClient loop user_id={} has finished", self.core.user_id);
    }

    async fn handle_frame(&self, text: &str) {
        match SignalMsg::from_json(text) {
            Ok(msg) => self.handle_signal(msg).await,
            Err(err) => tracing::warn!("Ignoring signaling frame: {}", err),
        }
    }

    async fn handle_signal(&self, msg: SignalMsg) {
        if msg.from == self.core.user_id || msg.channel == Some(Channel::Webrtc) {
            return;
        }
        let body = match msg.body() {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!("Ignoring envelope from {}: {}", msg.from, err);
                return;
            }
        };
        let res = match body {
            SignalBody::Connected(members) => {
                tracing::info!(
                    "user_id={} joined room_id={} with {} members",
                    self.core.user_id,
                    self.core.room_id,
                    members
                );
                self.request_join().await
            }
            SignalBody::JoinDataChannel if self.is_master => {
                self.create_peer(&msg.from, true).await.map(|_| ())
            }
            SignalBody::JoinDataChannel | SignalBody::JoinMediaChannel => Ok(()),
            SignalBody::Signal(payload) => {
                if msg.channel == Some(Channel::DataRtc) {
                    self.handle_payload(&msg.from, payload).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(err) = res {
            tracing::error!("Data channel signal from {} failed: {}", msg.from, err);
        }
    }

    async fn request_join(&self) -> Result<(), Error> {
        if self.is_master {
            return Ok(());
        }
        self.signaling
            .send_signal(self.core.control(REQUEST_JOIN_DATA_CHANNEL))
            .await
    }

    async fn handle_event(&self, event: DataEvent) {
        match event {
            DataEvent::LocalCandidate { peer_id, candidate } => {
                let res = match self
                    .core
                    .signal(&peer_id, &SignalPayload::Candidate(candidate))
                {
                    Ok(msg) => self.signaling.send_signal(msg).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = res {
                    tracing::warn!("Failed to send candidate to peer_id={}: {}", peer_id, err);
                }
            }
            DataEvent::StateChanged {
                peer_id,
                connection,
                state,
            } => {
                tracing::info!("Data peer_id={} connection state changed: {}", peer_id, state);
                if !self.core.is_current(&peer_id, &connection) {
                    return;
                }
                match state {
                    RTCPeerConnectionState::Connected => {
                        self.core.transition(&peer_id, PeerTransition::Connected);
                        self.core.flush_candidates(&peer_id).await;
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        self.core.transition(&peer_id, PeerTransition::Closed);
                        self.channels().remove(&peer_id);
                        if let Some(connection) = self.core.remove(&peer_id) {
                            if let Err(err) = connection.close().await {
                                tracing::warn!("Failed to close peer_id={}: {}", peer_id, err);
                            }
                        }
                    }
                    _ => {}
                }
            }
            DataEvent::ChannelReady { peer_id, channel } => {
                tracing::info!(
                    "DataChannel label={} of peer_id={} is ready",
                    channel.label(),
                    peer_id
                );
                self.channels().insert(peer_id, channel);
            }
        }
    }

    fn register_hooks(&self, peer_id: &str, connection: &Arc<RTCPeerConnection>) {
        let peer_id = peer_id.to_owned();
        let events = self.events.clone();

        connection.on_ice_candidate(Box::new(enc!((events, peer_id) move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(candidate) => {
                        let _ = events.send(DataEvent::LocalCandidate {
                            peer_id: peer_id.clone(),
                            candidate,
                        });
                    }
                    Err(err) => tracing::warn!("Failed to serialize candidate: {}", err),
                }
            }
            Box::pin(async {})
        })));

        let weak = Arc::downgrade(connection);
        connection.on_peer_connection_state_change(Box::new(enc!((events, peer_id) move |state: RTCPeerConnectionState| {
            let _ = events.send(DataEvent::StateChanged {
                peer_id: peer_id.clone(),
                connection: weak.clone(),
                state,
            });
            Box::pin(async {})
        })));

        let messages = self.messages.clone();
        connection.on_data_channel(Box::new(enc!((events, peer_id, messages) move |channel: Arc<RTCDataChannel>| {
            wire_channel(&peer_id, &channel, messages.clone());
            let _ = events.send(DataEvent::ChannelReady {
                peer_id: peer_id.clone(),
                channel,
            });
            Box::pin(async {})
        })));
    }
}

/// Publishes every text of `channel` as `(peer_id, text)`.
fn wire_channel(
    peer_id: &str,
    channel: &Arc<RTCDataChannel>,
    messages: broadcast::Sender<(String, String)>,
) {
    let peer_id = peer_id.to_owned();
    let label = channel.label().to_owned();
    channel.on_open(Box::new(enc!((peer_id, label) move || {
        tracing::info!("DataChannel label={} of peer_id={} is open", label, peer_id);
        Box::pin(async {})
    })));
    channel.on_close(Box::new(enc!((peer_id, label) move || {
        tracing::debug!("DataChannel label={} of peer_id={} has been closed", label, peer_id);
        Box::pin(async {})
    })));
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        tracing::debug!("DataChannel message from peer_id={}: {}", peer_id, text);
        // No subscriber is not an error.
        let _ = messages.send((peer_id.clone(), text));
        Box::pin(async {})
    }));
}

#[async_trait]
impl MeshHandler for DataChannelInner {
    fn core(&self) -> &MeshCore {
        &self.core
    }

    fn signaling(&self) -> &dyn Signaling {
        self.signaling.as_ref()
    }

    async fn create_peer(
        &self,
        peer_id: &str,
        is_caller: bool,
    ) -> Result<Arc<RTCPeerConnection>, Error> {
        tracing::info!("Setting up data channel for peer_id={}", peer_id);
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
        self.register_hooks(peer_id, &connection);
        if let Some(old) = self.core.insert(peer_id, connection.clone()) {
            tracing::info!("Replacing data connection of peer_id={}", peer_id);
            self.channels().remove(peer_id);
            tokio::spawn(async move {
                let _ = old.close().await;
            });
        }

        if is_caller {
            let channel = connection
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await
                .map_err(|e| {
                    Error::new_negotiation(
                        format!("Failed to create data channel: {}", e),
                        NegotiationErrorKind::PeerConnectionError,
                    )
                })?;
            wire_channel(peer_id, &channel, self.messages.clone());
            self.channels().insert(peer_id.to_owned(), channel);
            self.core
                .send_offer(peer_id, &connection, self.signaling.as_ref())
                .await?;
        }
        Ok(connection)
    }
}
