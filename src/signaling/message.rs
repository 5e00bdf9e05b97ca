use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::error::{DecodeErrorKind, Error};

/// Sent by a non-master peer that wants a data channel with the master.
pub const REQUEST_JOIN_DATA_CHANNEL: &str = "839d6af5-be15-474d-81c8-f34200007d4c";
/// Sent by a non-master peer that wants a media channel with the master.
pub const REQUEST_JOIN_MEDIA_CHANNEL: &str = "493aaf25-eea6-4f37-8f9f-eb4507811721";
/// Prefix of the acknowledgement a websocket receives right after joining a room.
pub const WEBSOCKET_CONNECTED: &str = "onConnected";
/// Sender id of envelopes originated by the signaling server itself.
pub const SERVER_ID: &str = "server";

/// Namespace of a signaling envelope.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Data channel negotiation.
    #[serde(rename = "dt")]
    #[strum(serialize = "dt")]
    DataRtc,
    /// Media negotiation.
    #[serde(rename = "md")]
    #[strum(serialize = "md")]
    Webrtc,
}

/// The wire unit of every signaling exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub msg: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// SDP and ICE payloads. On the wire they are `{"type": "...", "sdp": ...}`, base64 encoded into `msg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "sdp", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
}

/// What an envelope carries, decided before any base64 or JSON decoding is attempted.
#[derive(Debug, Clone)]
pub enum SignalBody {
    JoinDataChannel,
    JoinMediaChannel,
    /// Join acknowledgement with the number of members in the room.
    Connected(usize),
    Signal(SignalPayload),
}

impl SignalMsg {
    pub fn new(from: impl Into<String>, room_id: Option<String>, msg: Value) -> Self {
        Self {
            channel: None,
            from: from.into(),
            to: None,
            msg,
            room_id,
            status: None,
        }
    }

    /// A plain control token such as [`REQUEST_JOIN_MEDIA_CHANNEL`], carried unencoded.
    pub fn control(
        channel: Option<Channel>,
        from: impl Into<String>,
        room_id: impl Into<String>,
        token: &str,
    ) -> Self {
        let mut msg = Self::new(from, Some(room_id.into()), Value::String(token.to_owned()));
        msg.channel = channel;
        msg
    }

    /// A directed SDP or ICE envelope.
    pub fn signal(
        channel: Channel,
        from: impl Into<String>,
        to: impl Into<String>,
        room_id: impl Into<String>,
        payload: &SignalPayload,
    ) -> Result<Self, Error> {
        let mut msg = Self::new(from, Some(room_id.into()), Value::String(encode(payload)?));
        msg.channel = Some(channel);
        msg.to = Some(to.into());
        Ok(msg)
    }

    pub fn status(status: u16, text: impl Into<String>) -> Self {
        let mut msg = Self::new(SERVER_ID, None, Value::String(text.into()));
        msg.status = Some(status);
        msg
    }

    /// The acknowledgement echoed to a connection that just joined a room.
    pub fn connected(room_id: &str, member_count: usize) -> Self {
        let mut msg = Self::status(200, format!("{}-{}", WEBSOCKET_CONNECTED, member_count));
        msg.room_id = Some(room_id.to_owned());
        msg
    }

    /// The directed recipient. An empty `to` means broadcast.
    pub fn recipient(&self) -> Option<&str> {
        self.to.as_deref().filter(|to| !to.is_empty())
    }

    pub fn text(&self) -> Option<&str> {
        self.msg.as_str()
    }

    pub fn is_control(&self, token: &str) -> bool {
        self.text() == Some(token)
    }

    pub fn body(&self) -> Result<SignalBody, Error> {
        if let Some(text) = self.text() {
            if text == REQUEST_JOIN_DATA_CHANNEL {
                return Ok(SignalBody::JoinDataChannel);
            }
            if text == REQUEST_JOIN_MEDIA_CHANNEL {
                return Ok(SignalBody::JoinMediaChannel);
            }
            if self.status == Some(200) {
                if let Some(rest) = text.strip_prefix(WEBSOCKET_CONNECTED) {
                    let count = rest.trim_start_matches('-').parse().unwrap_or(0);
                    return Ok(SignalBody::Connected(count));
                }
            }
        }
        Ok(SignalBody::Signal(SignalPayload::from_value(&self.msg)?))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| {
            Error::new_decode(
                format!("Invalid signaling envelope: {}", e),
                DecodeErrorKind::JsonError,
            )
        })
    }
}

impl SignalPayload {
    /// Accepts base64(JSON), raw JSON text, or an inline JSON object.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        match value {
            Value::String(text) => match STANDARD.decode(text.trim()) {
                Ok(bytes) => from_json_bytes(&bytes),
                Err(_) => from_json_bytes(text.as_bytes()),
            },
            Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::new_decode(
                    format!("Unexpected signaling payload: {}", e),
                    DecodeErrorKind::UnexpectedPayloadError,
                )
            }),
            other => Err(Error::new_decode(
                format!("Unexpected signaling payload: {}", other),
                DecodeErrorKind::UnexpectedPayloadError,
            )),
        }
    }
}

/// Serializes `value` as JSON and wraps it in standard base64.
pub fn encode<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

/// Strict inverse of [`encode`].
pub fn decode<T: DeserializeOwned>(input: &str) -> Result<T, Error> {
    let bytes = STANDARD.decode(input.trim()).map_err(|e| {
        Error::new_decode(
            format!("Invalid base64 payload: {}", e),
            DecodeErrorKind::Base64Error,
        )
    })?;
    from_json_bytes(&bytes)
}

fn from_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| {
        Error::new_decode(
            format!("Invalid JSON payload: {}", e),
            DecodeErrorKind::JsonError,
        )
    })
}

/// A camera control record sent over the data channel, for example
/// `{"action": "camera", "cmd": "zoom", "val": 2.5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub action: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub val: f64,
}

/// Text received over a data channel.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Command(CommandRecord),
    Signal(SignalMsg),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InboundJson {
    Command(CommandRecord),
    Signal(SignalMsg),
}

impl InboundMessage {
    /// Records with an `action` field are commands, other JSON objects are envelopes, the rest is text.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<InboundJson>(text) {
            Ok(InboundJson::Command(command)) => InboundMessage::Command(command),
            Ok(InboundJson::Signal(msg)) => InboundMessage::Signal(msg),
            Err(_) => InboundMessage::Text(text.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    fn offer() -> RTCSessionDescription {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Offer;
        desc.sdp = "v=0\r\n".to_owned();
        desc
    }

    #[test]
    fn envelope_omits_unset_fields() {
        let msg = SignalMsg::control(None, "alice", "R1", REQUEST_JOIN_DATA_CHANNEL);
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["from"], "alice");
        assert_eq!(json["roomId"], "R1");
        assert_eq!(json["msg"], REQUEST_JOIN_DATA_CHANNEL);
        assert!(json.get("channel").is_none());
        assert!(json.get("to").is_none());
        assert!(json.get("status").is_none());
    }

    #[test]
    fn channel_uses_short_tags() {
        let msg =
            SignalMsg::control(Some(Channel::Webrtc), "a", "R1", REQUEST_JOIN_MEDIA_CHANNEL);
        assert!(msg.to_json().unwrap().contains("\"channel\":\"md\""));
        let parsed = SignalMsg::from_json(r#"{"channel":"dt","from":"b","msg":"x"}"#).unwrap();
        assert_eq!(parsed.channel, Some(Channel::DataRtc));
        assert_eq!(Channel::DataRtc.to_string(), "dt");
    }

    #[test]
    fn control_tokens_are_matched_before_decoding() {
        let msg = SignalMsg::control(None, "b", "R1", REQUEST_JOIN_MEDIA_CHANNEL);
        assert!(matches!(msg.body().unwrap(), SignalBody::JoinMediaChannel));
        let msg = SignalMsg::control(None, "b", "R1", REQUEST_JOIN_DATA_CHANNEL);
        assert!(matches!(msg.body().unwrap(), SignalBody::JoinDataChannel));
    }

    #[test]
    fn connected_ack_reports_member_count() {
        let msg = SignalMsg::connected("R1", 3);
        assert_eq!(msg.text(), Some("onConnected-3"));
        assert_eq!(msg.from, SERVER_ID);
        match msg.body().unwrap() {
            SignalBody::Connected(count) => assert_eq!(count, 3),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn signal_envelope_carries_base64_payload() {
        let msg = SignalMsg::signal(
            Channel::DataRtc,
            "alice",
            "bob",
            "R1",
            &SignalPayload::Offer(offer()),
        )
        .unwrap();
        assert_eq!(msg.recipient(), Some("bob"));

        let raw = msg.text().unwrap();
        let json: Value = decode(raw).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"]["type"], "offer");

        match msg.body().unwrap() {
            SignalBody::Signal(SignalPayload::Offer(desc)) => assert_eq!(desc.sdp, "v=0\r\n"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn candidate_payload_accepts_raw_json() {
        let value = Value::String(
            r#"{"type":"candidate","sdp":{"candidate":"candidate:1 1 UDP 2130706431 192.0.2.1 5000 typ host","sdpMid":"0"}}"#
                .to_owned(),
        );
        match SignalPayload::from_value(&value).unwrap() {
            SignalPayload::Candidate(candidate) => {
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn strict_decode_rejects_bad_base64() {
        let err = decode::<RTCSessionDescription>("%%% not base64").unwrap_err();
        assert_eq!(err.decode_kind(), Some(&DecodeErrorKind::Base64Error));

        let err = decode::<RTCSessionDescription>(&STANDARD.encode("{nope")).unwrap_err();
        assert_eq!(err.decode_kind(), Some(&DecodeErrorKind::JsonError));
    }

    #[test]
    fn empty_recipient_means_broadcast() {
        let msg = SignalMsg::from_json(r#"{"from":"a","to":"","msg":"hi"}"#).unwrap();
        assert_eq!(msg.recipient(), None);
    }

    #[test]
    fn inbound_messages_are_discriminated() {
        match InboundMessage::parse(r#"{"action":"camera","cmd":"zoom","val":2.5}"#) {
            InboundMessage::Command(cmd) => {
                assert_eq!(cmd.cmd, "zoom");
                assert_eq!(cmd.val, 2.5);
            }
            other => panic!("unexpected {:?}", other),
        }
        match InboundMessage::parse(r#"{"channel":"md","from":"gcs","msg":"abc"}"#) {
            InboundMessage::Signal(msg) => assert_eq!(msg.channel, Some(Channel::Webrtc)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            InboundMessage::parse("toggle-video"),
            InboundMessage::Text(_)
        ));
    }
}
