use std::sync::Arc;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ClientConfig,
    error::Error,
    media::source::MediaSource,
    mesh::{data_channel::DataChannelClient, video_channel::VideoChannelClient, Signaling},
    signaling::{
        message::{Channel, CommandRecord, InboundMessage, SignalMsg, REQUEST_JOIN_MEDIA_CHANNEL},
        websocket::WebsocketClient,
    },
};

/// `action` of camera control records.
pub const ACTION_CAMERA: &str = "camera";
/// Plain text that flips the local video stream.
pub const CMD_VIDEO_TOGGLE: &str = "toggle-video";

#[derive(Debug, Display, EnumString, EnumIter, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum CameraCommand {
    Zoom,
    Focus,
    Switch,
    Reset,
    Iso,
}

impl CameraCommand {
    /// Comma separated names of every command.
    pub fn supported() -> String {
        CameraCommand::iter()
            .map(|cmd| cmd.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Default)]
struct VideoState {
    client: Option<Arc<VideoChannelClient>>,
    enabled: bool,
}

/// UavController reacts to what peers send over the data channel: camera control records, video
/// toggles and media negotiation, which it hands to a video mesh client created on first use.
#[derive(Debug)]
pub struct UavController {
    config: ClientConfig,
    source: Arc<dyn MediaSource>,
    data_channel: Arc<DataChannelClient>,
    websocket: Option<Arc<WebsocketClient>>,
    signaling: Arc<dyn Signaling>,
    video: Mutex<VideoState>,
}

impl UavController {
    pub fn new(
        config: ClientConfig,
        source: Arc<dyn MediaSource>,
        data_channel: Arc<DataChannelClient>,
        websocket: Arc<WebsocketClient>,
    ) -> Self {
        Self {
            config,
            source,
            data_channel,
            signaling: websocket.clone(),
            websocket: Some(websocket),
            video: Mutex::new(VideoState::default()),
        }
    }

    /// A controller whose video client signals through `signaling` instead of a websocket.
    pub(crate) fn with_signaling(
        config: ClientConfig,
        source: Arc<dyn MediaSource>,
        data_channel: Arc<DataChannelClient>,
        signaling: Arc<dyn Signaling>,
    ) -> Self {
        Self {
            config,
            source,
            data_channel,
            websocket: None,
            signaling,
            video: Mutex::new(VideoState::default()),
        }
    }

    /// Handles data channel messages until `cancel` fires or the data channel client goes away.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut messages = self.data_channel.subscribe_messages();
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                received = messages.recv() => received,
            };
            match received {
                Ok((peer_id, text)) => {
                    if let Err(err) = self.handle_message(&peer_id, &text).await {
                        tracing::error!("Message from peer_id={} failed: {}", peer_id, err);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Controller skipped {} data channel messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("UavController loop has finished");
    }

    pub async fn handle_message(&self, peer_id: &str, text: &str) -> Result<(), Error> {
        match InboundMessage::parse(text) {
            InboundMessage::Command(command) if command.action == ACTION_CAMERA => {
                self.handle_camera(&command).await
            }
            InboundMessage::Command(command) => {
                tracing::warn!("Unknown action {} from peer_id={}", command.action, peer_id);
                Ok(())
            }
            InboundMessage::Signal(msg) => self.forward_signal(msg).await,
            InboundMessage::Text(text) if text.trim() == CMD_VIDEO_TOGGLE => {
                self.toggle_video().await
            }
            InboundMessage::Text(text) => {
                tracing::info!("Text from peer_id={}: {}", peer_id, text);
                Ok(())
            }
        }
    }

    async fn handle_camera(&self, command: &CommandRecord) -> Result<(), Error> {
        let cmd = match command.cmd.parse::<CameraCommand>() {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(
                    "Camera command {}: {}, expected one of {}",
                    command.cmd,
                    err,
                    CameraCommand::supported()
                );
                return Ok(());
            }
        };
        tracing::info!("Camera command {} val={}", cmd, command.val);
        match cmd {
            CameraCommand::Zoom => self.source.set_zoom(command.val).await,
            CameraCommand::Focus => self.source.set_focus(command.val as i32).await,
            CameraCommand::Switch => self.source.switch_camera(command.val as i32).await,
            CameraCommand::Reset => self.source.restart().await?,
            CameraCommand::Iso => self.source.set_iso(command.val as i32).await,
        }
        Ok(())
    }

    async fn forward_signal(&self, msg: SignalMsg) -> Result<(), Error> {
        let join = msg.is_control(REQUEST_JOIN_MEDIA_CHANNEL);
        if !join && msg.channel != Some(Channel::Webrtc) {
            tracing::debug!("Ignoring envelope from {} on the data channel", msg.from);
            return Ok(());
        }
        let mut video = self.video.lock().await;
        let client = self.video_client(&mut video).await?;
        // Streaming starts before the joining peer is offered.
        if join {
            video.enabled = true;
            client.toggle_local_video(true).await;
        }
        client.handle_signal_msg(msg);
        Ok(())
    }

    async fn toggle_video(&self) -> Result<(), Error> {
        let mut video = self.video.lock().await;
        video.enabled = !video.enabled;
        tracing::info!("Video toggled, enabled={}", video.enabled);
        if video.enabled {
            let client = self.video_client(&mut video).await?;
            client.toggle_local_video(true).await;
        } else if let Some(client) = &video.client {
            client.toggle_local_video(false).await;
        }
        Ok(())
    }

    async fn video_client(&self, video: &mut VideoState) -> Result<Arc<VideoChannelClient>, Error> {
        if let Some(client) = &video.client {
            return Ok(client.clone());
        }
        let client = match &self.websocket {
            Some(websocket) => {
                VideoChannelClient::connect(&self.config, self.source.clone(), websocket.clone())
                    .await?
            }
            None => {
                // Without a websocket every envelope arrives through the data channel.
                let (_, frames) = mpsc::channel(1);
                VideoChannelClient::start(
                    &self.config,
                    self.source.clone(),
                    self.signaling.clone(),
                    frames,
                    None,
                )?
            }
        };
        client.set_data_channel(Some(self.data_channel.clone()));
        let client = Arc::new(client);
        video.client = Some(client.clone());
        Ok(client)
    }

    pub async fn is_video_enabled(&self) -> bool {
        self.video.lock().await.enabled
    }

    pub async fn video_client_started(&self) -> bool {
        self.video.lock().await.client.is_some()
    }

    /// Closes the video client, the data channel client and the websocket they share.
    pub async fn close(&self) {
        let client = self.video.lock().await.client.take();
        if let Some(client) = client {
            client.close().await;
        }
        self.data_channel.close().await;
    }
}
