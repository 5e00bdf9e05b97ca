use std::{env, time::Duration};

use derivative::Derivative;

use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8},
        APIBuilder, API,
    },
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    peer_connection::configuration::RTCConfiguration,
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        RTCPFeedback,
    },
};

use crate::error::Error;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Codecs and RTCP behaviour shared by every peer connection.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub codecs: Vec<RTCRtpCodecParameters>,
    /// Interval of the Picture Loss Indication sent to publishers.
    pub pli_interval: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let rtcp_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ];
        Self {
            codecs: vec![
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line:
                            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                                .to_owned(),
                        rtcp_feedback: rtcp_feedback.clone(),
                    },
                    payload_type: 102,
                    ..Default::default()
                },
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_owned(),
                        rtcp_feedback,
                    },
                    payload_type: 96,
                    ..Default::default()
                },
            ],
            pli_interval: Duration::from_secs(3),
        }
    }
}

impl MediaConfig {
    /// Builds the webrtc [`API`] with the configured video codecs and the default interceptors.
    pub fn build_api(&self) -> Result<API, Error> {
        let mut media_engine = MediaEngine::default();
        for codec in self.codecs.iter() {
            media_engine.register_codec(codec.clone(), RTPCodecType::Video)?;
        }
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self::with_stun_urls(vec![DEFAULT_STUN_URL.to_owned()])
    }
}

impl WebRTCTransportConfig {
    pub fn with_stun_urls(urls: Vec<String>) -> Self {
        Self {
            configuration: RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls,
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    fn from_env() -> Self {
        match env::var("STUN_URLS") {
            Ok(value) => {
                let urls = split_list(&value);
                if urls.is_empty() {
                    Self::default()
                } else {
                    Self::with_stun_urls(urls)
                }
            }
            Err(_) => Self::default(),
        }
    }
}

/// How long a subscriber waits for the publisher it asked for.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// `None` waits until the publisher shows up.
    pub wait_timeout: Option<Duration>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub media: MediaConfig,
    pub transport: WebRTCTransportConfig,
    pub routing: RoutingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_owned(),
            media: MediaConfig::default(),
            transport: WebRTCTransportConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.transport = WebRTCTransportConfig::from_env();
        if let Ok(value) = env::var("ROUTING_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(0) => config.routing.wait_timeout = None,
                Ok(secs) => config.routing.wait_timeout = Some(Duration::from_secs(secs)),
                Err(err) => {
                    tracing::warn!("Ignoring ROUTING_TIMEOUT_SECS={}: {}", value, err);
                }
            }
        }
        config
    }
}

/// Settings of a non-browser mesh client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base websocket url, for example `ws://127.0.0.1:4000/ws`.
    pub signal_url: String,
    pub room_id: String,
    pub user_id: String,
    pub is_master: bool,
    pub transport: WebRTCTransportConfig,
    /// Annex-B file streamed when no camera is attached.
    pub video_file: Option<String>,
    /// Local UDP port the camera encoder sends RTP to when no file is configured.
    pub rtp_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: "ws://127.0.0.1:4000/ws".to_owned(),
            room_id: "uav".to_owned(),
            user_id: "uav_1".to_owned(),
            is_master: true,
            transport: WebRTCTransportConfig::default(),
            video_file: None,
            rtp_port: 5600,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("SIGNAL_URL") {
            config.signal_url = url;
        }
        if let Ok(room) = env::var("ROOM_ID") {
            config.room_id = room;
        }
        if let Ok(user) = env::var("USER_ID") {
            config.user_id = user;
        }
        if let Ok(master) = env::var("IS_MASTER") {
            config.is_master = master != "false";
        }
        config.transport = WebRTCTransportConfig::from_env();
        config.video_file = env::var("VIDEO_FILE").ok();
        if let Some(port) = env::var("RTP_PORT").ok().and_then(|p| p.parse().ok()) {
            config.rtp_port = port;
        }
        config
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
        .collect()
}
