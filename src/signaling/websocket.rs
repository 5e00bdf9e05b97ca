use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use derivative::Derivative;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{http::Uri, Message};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, TransportErrorKind},
    signaling::message::SignalMsg,
};

pub const SUBSCRIBER_QUEUE_SIZE: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ClientState {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    subscribers: Vec<mpsc::Sender<String>>,
    /// Stops the read loop of the current connection.
    connection: Option<CancellationToken>,
    /// Bumped on every connect so a finishing read loop leaves a newer connection alone.
    generation: u64,
}

impl ClientState {
    fn disconnect(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }
        if let Some(connection) = self.connection.take() {
            connection.cancel();
        }
        self.subscribers.clear();
    }
}

/// WebsocketClient is one signaling connection to a room. Every subscriber receives every inbound frame;
/// a subscriber that falls behind loses frames instead of stalling the others.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebsocketClient {
    url: String,
    #[derivative(Debug = "ignore")]
    state: Arc<Mutex<ClientState>>,
    /// Parent of every connection token, cancelled when the client is dropped.
    dropped: CancellationToken,
}

impl WebsocketClient {
    /// `url` is the websocket base, for example `ws://127.0.0.1:4000/ws`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(Mutex::new(ClientState::default())),
            dropped: CancellationToken::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().outbound.is_some()
    }

    /// Dials `{url}/join/{room_id}/c/{user_id}` and starts the read loop. Connecting twice is a no-op, and a
    /// closed client can connect again.
    pub async fn connect(&self, room_id: &str, user_id: &str) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        let join_url = format!(
            "{}/join/{}/c/{}",
            self.url.trim_end_matches('/'),
            room_id,
            user_id
        );
        join_url.parse::<Uri>().map_err(|e| {
            Error::new_transport(
                format!("Invalid websocket url {}: {}", join_url, e),
                TransportErrorKind::InvalidUrlError,
            )
        })?;
        tracing::info!("Connecting to {}", join_url);

        let (stream, _response) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(&join_url))
                .await
                .map_err(|_| {
                    Error::new_transport(
                        format!("Websocket handshake with {} timed out", join_url),
                        TransportErrorKind::DialError,
                    )
                })?
                .map_err(|e| {
                    Error::new_transport(
                        format!("Websocket dial error: {}", e),
                        TransportErrorKind::DialError,
                    )
                })?;
        let (mut sink, mut source) = stream.split();
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Message>();
        let closed = self.dropped.child_token();
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.outbound = Some(outbound_sender);
            state.connection = Some(closed.clone());
            state.generation
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_receiver.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    tracing::warn!("Websocket write error: {}", err);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => {
                        break;
                    }
                    frame = source.next() => frame,
                };
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::warn!("Ignoring non UTF-8 binary frame: {}", err);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!("Websocket read error: {}", err);
                        break;
                    }
                };
                Self::fan_out(&state, text);
            }

            let mut state = match state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.generation == generation {
                state.outbound = None;
                state.connection = None;
                state.subscribers.clear();
            }
            tracing::debug!("Websocket read loop generation={} has finished", generation);
        });

        Ok(())
    }

    fn fan_out(state: &Mutex<ClientState>, text: String) {
        let mut state = match state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.subscribers.retain(|subscriber| {
            match subscriber.try_send(text.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Dropping message for slow subscriber");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// A new queue receiving every inbound frame from now on. It is closed when the connection ends; a queue
    /// taken while disconnected starts with the next connection.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        self.state().subscribers.push(sender);
        receiver
    }

    pub fn send(&self, msg: &SignalMsg) -> Result<(), Error> {
        let text = msg.to_json()?;
        let state = self.state();
        let outbound = state.outbound.as_ref().ok_or_else(|| {
            Error::new_transport(
                "Websocket is not connected".to_string(),
                TransportErrorKind::NotConnectedError,
            )
        })?;
        outbound.send(Message::Text(text)).map_err(|_| {
            Error::new_transport(
                "Websocket is closed".to_string(),
                TransportErrorKind::ClosedError,
            )
        })
    }

    /// Sends a close frame, stops the read loop and closes every subscriber queue.
    pub fn close(&self) {
        self.state().disconnect();
    }
}

impl Drop for WebsocketClient {
    fn drop(&mut self) {
        self.close();
        self.dropped.cancel();
        tracing::debug!("WebsocketClient {} is dropped", self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        call::{Negotiator, PeerInfo},
        error::NegotiationErrorKind,
        signaling::{
            endpoint::SignalingEndpoint,
            message::{SignalBody, REQUEST_JOIN_DATA_CHANNEL},
            room::RoomRegistry,
        },
    };
    use actix_web::{App, HttpServer};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct RejectingNegotiator;

    #[async_trait]
    impl Negotiator for RejectingNegotiator {
        async fn negotiate(&self, _offer: &str, _info: PeerInfo) -> Result<String, Error> {
            Err(Error::new_negotiation(
                "unused".to_string(),
                NegotiationErrorKind::PeerConnectionError,
            ))
        }
    }

    async fn next(rx: &mut mpsc::Receiver<String>) -> SignalMsg {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("subscriber queue closed");
        SignalMsg::from_json(&text).unwrap()
    }

    #[actix_web::test]
    async fn room_messages_flow_between_clients() {
        let rooms = Arc::new(RoomRegistry::new());
        let endpoint = SignalingEndpoint::new(Arc::new(RejectingNegotiator), rooms.clone());
        let server = HttpServer::new(move || {
            App::new().configure(|cfg| endpoint.clone().configure(cfg))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        let base = format!("ws://{}/ws", addr);

        let alice = WebsocketClient::new(&base);
        let mut alice_rx = alice.subscribe();
        alice.connect("R1", "alice").await.unwrap();
        assert!(matches!(next(&mut alice_rx).await.body().unwrap(), SignalBody::Connected(1)));

        let bob = WebsocketClient::new(&base);
        let mut bob_rx = bob.subscribe();
        bob.connect("R1", "bob").await.unwrap();
        assert!(matches!(next(&mut bob_rx).await.body().unwrap(), SignalBody::Connected(2)));

        alice
            .send(&SignalMsg::control(None, "alice", "R1", REQUEST_JOIN_DATA_CHANNEL))
            .unwrap();
        let received = next(&mut bob_rx).await;
        assert_eq!(received.from, "alice");
        assert!(received.is_control(REQUEST_JOIN_DATA_CHANNEL));
        let ack = next(&mut alice_rx).await;
        assert_eq!(ack.status, Some(200));
        assert_eq!(ack.text(), Some("Send broadcast msg successfully"));

        let mut directed = SignalMsg::new("bob", Some("R1".to_string()), "hi alice".into());
        directed.to = Some("alice".to_string());
        bob.send(&directed).unwrap();
        assert_eq!(next(&mut alice_rx).await.text(), Some("hi alice"));
        let ack = next(&mut bob_rx).await;
        assert_eq!(ack.status, Some(200));
        assert_eq!(ack.text(), Some("Sent to alice"));

        let mut directed = SignalMsg::new("bob", Some("R1".to_string()), "psst".into());
        directed.to = Some("ghost".to_string());
        bob.send(&directed).unwrap();
        let status = next(&mut bob_rx).await;
        assert_eq!(status.status, Some(500));
        assert_eq!(status.text(), Some("Failed to send message to ghost"));

        alice.close();
        assert!(!alice.is_connected());
        assert!(tokio::time::timeout(Duration::from_secs(5), alice_rx.recv())
            .await
            .unwrap()
            .is_none());

        // A closed client can join again and keeps receiving.
        let mut alice_rx = alice.subscribe();
        alice.connect("R1", "alice").await.unwrap();
        assert!(matches!(next(&mut alice_rx).await.body().unwrap(), SignalBody::Connected(2)));
        bob.send(&SignalMsg::new("bob", None, "welcome back".into()))
            .unwrap();
        assert_eq!(next(&mut alice_rx).await.text(), Some("welcome back"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alice.is_connected());

        alice.close();
        bob.close();
        handle.stop(true).await;
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let client = WebsocketClient::new("ws://127.0.0.1:1/ws");
        let err = client
            .send(&SignalMsg::new("a", None, "x".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TransportError(ref e) if e.kind == TransportErrorKind::NotConnectedError
        ));
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let client = WebsocketClient::new("ws://127.0.0.1:1/ws");
        let err = client.connect("R1", "u1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransportError(ref e) if e.kind == TransportErrorKind::DialError
        ));
        assert!(!client.is_connected());
    }
}
