//! Peer to peer clients for devices that are not browsers. Each client keeps one peer connection per
//! remote user and negotiates it over a [`Signaling`] transport.
pub mod data_channel;
pub mod video_channel;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use async_trait::async_trait;
use derivative::Derivative;
use strum_macros::Display;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{sdp::session_description::RTCSessionDescription, RTCPeerConnection},
};

use crate::{
    error::{Error, NegotiationErrorKind},
    signaling::{
        message::{Channel, SignalMsg, SignalPayload},
        websocket::WebsocketClient,
    },
};

/// Outbound path for signaling envelopes.
#[async_trait]
pub trait Signaling: Send + Sync + fmt::Debug {
    async fn send_signal(&self, msg: SignalMsg) -> Result<(), Error>;
}

#[async_trait]
impl Signaling for WebsocketClient {
    async fn send_signal(&self, msg: SignalMsg) -> Result<(), Error> {
        self.send(&msg)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Negotiation progress with one remote peer.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    #[default]
    NoConnection,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransition {
    LocalOffer,
    RemoteOffer,
    Answer,
    Connected,
    Closed,
}

impl PeerState {
    /// Transitions that do not apply to the current state leave it unchanged. Closed is final.
    pub fn next(self, transition: PeerTransition) -> PeerState {
        match (self, transition) {
            (PeerState::Closed, _) => PeerState::Closed,
            (_, PeerTransition::Closed) => PeerState::Closed,
            (
                PeerState::NoConnection | PeerState::AnswerExchanged | PeerState::Connected,
                PeerTransition::LocalOffer,
            ) => PeerState::OfferSent,
            (
                PeerState::NoConnection | PeerState::AnswerExchanged | PeerState::Connected,
                PeerTransition::RemoteOffer,
            ) => PeerState::OfferReceived,
            (PeerState::OfferSent | PeerState::OfferReceived, PeerTransition::Answer) => {
                PeerState::AnswerExchanged
            }
            (_, PeerTransition::Connected) => PeerState::Connected,
            (state, _) => state,
        }
    }
}

/// ICE candidates that arrived before the remote description of their peer.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queues: HashMap<String, Vec<RTCIceCandidateInit>>,
}

impl PendingCandidates {
    pub fn push(&mut self, peer_id: &str, candidate: RTCIceCandidateInit) {
        self.queues
            .entry(peer_id.to_owned())
            .or_default()
            .push(candidate);
    }

    /// Removes and returns the queue of `peer_id` in arrival order.
    pub fn take(&mut self, peer_id: &str) -> Vec<RTCIceCandidateInit> {
        self.queues.remove(peer_id).unwrap_or_default()
    }

    pub fn len(&self, peer_id: &str) -> usize {
        self.queues.get(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct MeshPeer {
    #[derivative(Debug = "ignore")]
    connection: Arc<RTCPeerConnection>,
    state: PeerState,
}

#[derive(Debug, Default)]
struct MeshPeers {
    peers: HashMap<String, MeshPeer>,
    pending: PendingCandidates,
}

/// Offer, answer and candidate handling shared by the mesh clients.
#[derive(Debug)]
pub(crate) struct MeshCore {
    pub(crate) user_id: String,
    pub(crate) room_id: String,
    channel: Channel,
    peers: Mutex<MeshPeers>,
}

impl MeshCore {
    pub(crate) fn new(user_id: String, room_id: String, channel: Channel) -> Self {
        Self {
            user_id,
            room_id,
            channel,
            peers: Mutex::new(MeshPeers::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeshPeers> {
        lock(&self.peers)
    }

    pub(crate) fn connection(&self, peer_id: &str) -> Option<Arc<RTCPeerConnection>> {
        self.lock()
            .peers
            .get(peer_id)
            .map(|peer| peer.connection.clone())
    }

    pub(crate) fn connections(&self) -> Vec<(String, Arc<RTCPeerConnection>)> {
        self.lock()
            .peers
            .iter()
            .map(|(id, peer)| (id.clone(), peer.connection.clone()))
            .collect()
    }

    /// Whether `connection` is still the one installed for `peer_id`. Events of replaced connections
    /// must not touch the newer one.
    pub(crate) fn is_current(&self, peer_id: &str, connection: &Weak<RTCPeerConnection>) -> bool {
        self.lock()
            .peers
            .get(peer_id)
            .map(|peer| Arc::as_ptr(&peer.connection) == Weak::as_ptr(connection))
            .unwrap_or(false)
    }

    pub(crate) fn peer_ids(&self) -> Vec<String> {
        self.lock().peers.keys().cloned().collect()
    }

    pub(crate) fn state(&self, peer_id: &str) -> PeerState {
        self.lock()
            .peers
            .get(peer_id)
            .map(|peer| peer.state)
            .unwrap_or_default()
    }

    pub(crate) fn pending_len(&self, peer_id: &str) -> usize {
        self.lock().pending.len(peer_id)
    }

    /// Installs `connection` for `peer_id` and returns the connection it replaces, if any.
    pub(crate) fn insert(
        &self,
        peer_id: &str,
        connection: Arc<RTCPeerConnection>,
    ) -> Option<Arc<RTCPeerConnection>> {
        self.lock()
            .peers
            .insert(
                peer_id.to_owned(),
                MeshPeer {
                    connection,
                    state: PeerState::NoConnection,
                },
            )
            .map(|old| old.connection)
    }

    pub(crate) fn remove(&self, peer_id: &str) -> Option<Arc<RTCPeerConnection>> {
        let mut peers = self.lock();
        peers.pending.take(peer_id);
        peers.peers.remove(peer_id).map(|peer| peer.connection)
    }

    pub(crate) fn transition(&self, peer_id: &str, transition: PeerTransition) -> PeerState {
        let mut peers = self.lock();
        let Some(peer) = peers.peers.get_mut(peer_id) else {
            return PeerState::NoConnection;
        };
        let next = peer.state.next(transition);
        if next != peer.state {
            tracing::debug!(
                "{} peer_id={} state changed: {} -> {}",
                self.channel,
                peer_id,
                peer.state,
                next
            );
        }
        peer.state = next;
        next
    }

    /// A directed envelope from this user to `peer_id`.
    pub(crate) fn signal(&self, peer_id: &str, payload: &SignalPayload) -> Result<SignalMsg, Error> {
        SignalMsg::signal(
            self.channel,
            self.user_id.clone(),
            peer_id,
            self.room_id.clone(),
            payload,
        )
    }

    pub(crate) fn control(&self, token: &str) -> SignalMsg {
        SignalMsg::control(
            Some(self.channel),
            self.user_id.clone(),
            self.room_id.clone(),
            token,
        )
    }

    pub(crate) async fn send_offer(
        &self,
        peer_id: &str,
        connection: &RTCPeerConnection,
        signaling: &dyn Signaling,
    ) -> Result<(), Error> {
        let offer = connection.create_offer(None).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to create offer for {}: {}", peer_id, e),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                Error::new_negotiation(
                    format!("Failed to set local offer for {}: {}", peer_id, e),
                    NegotiationErrorKind::LocalDescriptionError,
                )
            })?;
        let local = connection.local_description().await.unwrap_or(offer);
        self.transition(peer_id, PeerTransition::LocalOffer);
        signaling
            .send_signal(self.signal(peer_id, &SignalPayload::Offer(local))?)
            .await
    }

    pub(crate) async fn accept_offer(
        &self,
        peer_id: &str,
        connection: &RTCPeerConnection,
        offer: RTCSessionDescription,
        signaling: &dyn Signaling,
    ) -> Result<usize, Error> {
        connection.set_remote_description(offer).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to set remote offer of {}: {}", peer_id, e),
                NegotiationErrorKind::RemoteDescriptionError,
            )
        })?;
        self.transition(peer_id, PeerTransition::RemoteOffer);

        let answer = connection.create_answer(None).await.map_err(|e| {
            Error::new_negotiation(
                format!("Failed to create answer for {}: {}", peer_id, e),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                Error::new_negotiation(
                    format!("Failed to set local answer for {}: {}", peer_id, e),
                    NegotiationErrorKind::LocalDescriptionError,
                )
            })?;
        let local = connection.local_description().await.unwrap_or(answer);
        self.transition(peer_id, PeerTransition::Answer);
        let sent = match self.signal(peer_id, &SignalPayload::Answer(local)) {
            Ok(msg) => signaling.send_signal(msg).await,
            Err(err) => Err(err),
        };
        let applied = self.flush_candidates(peer_id).await.len();
        sent.map(|_| applied)
    }

    pub(crate) async fn accept_answer(
        &self,
        peer_id: &str,
        answer: RTCSessionDescription,
    ) -> Result<usize, Error> {
        let Some(connection) = self.connection(peer_id) else {
            tracing::warn!("{} answer from unknown peer_id={}", self.channel, peer_id);
            return Ok(0);
        };
        connection
            .set_remote_description(answer)
            .await
            .map_err(|e| {
                Error::new_negotiation(
                    format!("Failed to set remote answer of {}: {}", peer_id, e),
                    NegotiationErrorKind::RemoteDescriptionError,
                )
            })?;
        self.transition(peer_id, PeerTransition::Answer);
        Ok(self.flush_candidates(peer_id).await.len())
    }

    /// Applies `candidate` when the remote description of `peer_id` is known, queues it otherwise.
    pub(crate) async fn add_candidate(
        &self,
        peer_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), Error> {
        if let Some(connection) = self.connection(peer_id) {
            if connection.remote_description().await.is_some() {
                connection.add_ice_candidate(candidate).await?;
                return Ok(());
            }
        }
        tracing::debug!("{} queueing candidate of peer_id={}", self.channel, peer_id);
        self.lock().pending.push(peer_id, candidate);
        Ok(())
    }

    /// Applies queued candidates of `peer_id` in arrival order and returns the accepted ones in that order.
    pub(crate) async fn flush_candidates(&self, peer_id: &str) -> Vec<RTCIceCandidateInit> {
        let Some(connection) = self.connection(peer_id) else {
            return Vec::new();
        };
        let candidates = self.lock().pending.take(peer_id);
        let mut applied = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match connection.add_ice_candidate(candidate.clone()).await {
                Ok(()) => applied.push(candidate),
                Err(err) => {
                    tracing::warn!("Failed to add candidate of peer_id={}: {}", peer_id, err);
                }
            }
        }
        if !applied.is_empty() {
            tracing::debug!(
                "{} applied {} queued candidates of peer_id={}",
                self.channel,
                applied.len(),
                peer_id
            );
        }
        applied
    }

    pub(crate) async fn close_all(&self) {
        let connections: Vec<(String, Arc<RTCPeerConnection>)> = {
            let mut peers = self.lock();
            peers.pending.clear();
            peers
                .peers
                .drain()
                .map(|(id, peer)| (id, peer.connection))
                .collect()
        };
        for (peer_id, connection) in connections {
            if let Err(err) = connection.close().await {
                tracing::error!("Failed to close peer_id={}: {}", peer_id, err);
            }
        }
    }
}

/// The peer connection lifecycle of a mesh client. Implementors create connections; the provided
/// [`MeshHandler::handle_payload`] drives the offer, answer and candidate exchange.
#[async_trait]
pub(crate) trait MeshHandler: Send + Sync {
    fn core(&self) -> &MeshCore;

    fn signaling(&self) -> &dyn Signaling;

    async fn create_peer(
        &self,
        peer_id: &str,
        is_caller: bool,
    ) -> Result<Arc<RTCPeerConnection>, Error>;

    async fn handle_payload(&self, from: &str, payload: SignalPayload) -> Result<(), Error> {
        match payload {
            SignalPayload::Offer(offer) => {
                let connection = match self.core().connection(from) {
                    Some(connection) => connection,
                    None => self.create_peer(from, false).await?,
                };
                self.core()
                    .accept_offer(from, &connection, offer, self.signaling())
                    .await
                    .map(|_| ())
            }
            SignalPayload::Answer(answer) => {
                self.core().accept_answer(from, answer).await.map(|_| ())
            }
            SignalPayload::Candidate(candidate) => self.core().add_candidate(from, candidate).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::{ClientConfig, MediaConfig, WebRTCTransportConfig},
        signaling::message::SignalBody,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use webrtc::{api::API, peer_connection::configuration::RTCConfiguration};

    /// Records every envelope instead of sending it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSignaling {
        pub sent: Mutex<Vec<SignalMsg>>,
    }

    impl RecordingSignaling {
        pub fn sent(&self) -> Vec<SignalMsg> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Signaling for RecordingSignaling {
        async fn send_signal(&self, msg: SignalMsg) -> Result<(), Error> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    /// Delivers envelopes to the websocket frames of another client.
    #[derive(Debug)]
    pub(crate) struct Pipe(pub mpsc::Sender<String>);

    #[async_trait]
    impl Signaling for Pipe {
        async fn send_signal(&self, msg: SignalMsg) -> Result<(), Error> {
            let _ = self.0.send(msg.to_json()?).await;
            Ok(())
        }
    }

    pub(crate) fn client_config(user_id: &str, is_master: bool) -> ClientConfig {
        ClientConfig {
            room_id: "R1".to_owned(),
            user_id: user_id.to_owned(),
            is_master,
            transport: WebRTCTransportConfig {
                configuration: RTCConfiguration::default(),
            },
            ..Default::default()
        }
    }

    pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition was not met in time");
    }

    pub(crate) fn candidate(port: u16) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:1 1 udp 2130706431 192.0.2.1 {} typ host", port),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn connection(api: &API) -> Arc<RTCPeerConnection> {
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    #[test]
    fn peer_state_follows_negotiation() {
        let caller = PeerState::default()
            .next(PeerTransition::LocalOffer)
            .next(PeerTransition::Answer)
            .next(PeerTransition::Connected);
        assert_eq!(caller, PeerState::Connected);

        let callee = PeerState::NoConnection.next(PeerTransition::RemoteOffer);
        assert_eq!(callee, PeerState::OfferReceived);
        assert_eq!(callee.next(PeerTransition::Answer), PeerState::AnswerExchanged);

        assert_eq!(
            PeerState::NoConnection.next(PeerTransition::Answer),
            PeerState::NoConnection
        );
        let closed = caller.next(PeerTransition::Closed);
        assert_eq!(closed.next(PeerTransition::RemoteOffer), PeerState::Closed);
        assert_eq!(closed.to_string(), "Closed");
    }

    #[test]
    fn pending_candidates_are_taken_once_in_order() {
        let mut pending = PendingCandidates::default();
        pending.push("alice", candidate(1));
        pending.push("bob", candidate(9));
        pending.push("alice", candidate(2));
        pending.push("alice", candidate(3));
        assert_eq!(pending.len("alice"), 3);

        let ports: Vec<String> = pending
            .take("alice")
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(ports, vec![candidate(1).candidate, candidate(2).candidate, candidate(3).candidate]);
        assert!(pending.take("alice").is_empty());
        assert_eq!(pending.len("bob"), 1);
    }

    fn candidate_lines(candidates: &[RTCIceCandidateInit]) -> Vec<String> {
        candidates.iter().map(|c| c.candidate.clone()).collect()
    }

    #[tokio::test]
    async fn candidates_wait_for_the_remote_description() {
        let api = MediaConfig::default().build_api().unwrap();
        let alice = MeshCore::new("alice".to_owned(), "R1".to_owned(), Channel::DataRtc);
        let bob = MeshCore::new("bob".to_owned(), "R1".to_owned(), Channel::DataRtc);
        let alice_signals = RecordingSignaling::default();
        let bob_signals = RecordingSignaling::default();

        let alice_conn = connection(&api).await;
        alice_conn.create_data_channel("chat", None).await.unwrap();
        alice.insert("bob", alice_conn.clone());
        let bob_conn = connection(&api).await;
        bob.insert("alice", bob_conn.clone());

        bob.add_candidate("alice", candidate(50000)).await.unwrap();
        bob.add_candidate("alice", candidate(50001)).await.unwrap();
        assert_eq!(bob.pending_len("alice"), 2);

        alice.send_offer("bob", &alice_conn, &alice_signals).await.unwrap();
        assert_eq!(alice.state("bob"), PeerState::OfferSent);
        // The caller has no remote description until the answer arrives.
        alice.add_candidate("bob", candidate(50100)).await.unwrap();
        alice.add_candidate("bob", candidate(50101)).await.unwrap();
        alice.add_candidate("bob", candidate(50102)).await.unwrap();
        assert_eq!(alice.pending_len("bob"), 3);

        let offer = alice_signals.sent().pop().unwrap();
        assert_eq!(offer.channel, Some(Channel::DataRtc));
        assert_eq!(offer.to.as_deref(), Some("bob"));
        let SignalBody::Signal(SignalPayload::Offer(offer)) = offer.body().unwrap() else {
            panic!("expected an offer");
        };

        let applied = bob
            .accept_offer("alice", &bob_conn, offer, &bob_signals)
            .await
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(bob.state("alice"), PeerState::AnswerExchanged);
        assert_eq!(bob.pending_len("alice"), 0);
        assert!(bob.flush_candidates("alice").await.is_empty());

        // Once the remote description is known candidates are applied without queueing.
        bob.add_candidate("alice", candidate(50002)).await.unwrap();
        assert_eq!(bob.pending_len("alice"), 0);

        let answer = bob_signals.sent().pop().unwrap();
        let SignalBody::Signal(SignalPayload::Answer(answer)) = answer.body().unwrap() else {
            panic!("expected an answer");
        };
        assert_eq!(alice.accept_answer("bob", answer).await.unwrap(), 3);
        assert_eq!(alice.state("bob"), PeerState::AnswerExchanged);
        assert_eq!(alice.pending_len("bob"), 0);

        alice.close_all().await;
        bob.close_all().await;
        assert!(alice.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn queued_candidates_are_applied_in_arrival_order() {
        let api = MediaConfig::default().build_api().unwrap();
        let caller = connection(&api).await;
        caller.create_data_channel("chat", None).await.unwrap();
        let offer = caller.create_offer(None).await.unwrap();

        let core = MeshCore::new("bob".to_owned(), "R1".to_owned(), Channel::DataRtc);
        let bob_conn = connection(&api).await;
        core.insert("alice", bob_conn.clone());
        for port in [50003, 50001, 50002] {
            core.add_candidate("alice", candidate(port)).await.unwrap();
        }
        // Nothing can be applied before the remote description.
        assert!(bob_conn.remote_description().await.is_none());
        assert_eq!(core.pending_len("alice"), 3);

        bob_conn.set_remote_description(offer).await.unwrap();
        let applied = core.flush_candidates("alice").await;
        assert_eq!(
            candidate_lines(&applied),
            candidate_lines(&[candidate(50003), candidate(50001), candidate(50002)])
        );
        assert_eq!(core.pending_len("alice"), 0);
        assert!(core.flush_candidates("alice").await.is_empty());

        core.close_all().await;
        caller.close().await.unwrap();
    }

    #[tokio::test]
    async fn candidates_of_removed_peers_are_dropped() {
        let api = MediaConfig::default().build_api().unwrap();
        let core = MeshCore::new("bob".to_owned(), "R1".to_owned(), Channel::DataRtc);
        core.insert("alice", connection(&api).await);
        core.add_candidate("alice", candidate(50000)).await.unwrap();
        assert_eq!(core.pending_len("alice"), 1);

        let removed = core.remove("alice").unwrap();
        assert_eq!(core.pending_len("alice"), 0);
        assert!(core.flush_candidates("alice").await.is_empty());
        removed.close().await.unwrap();
    }

    #[tokio::test]
    async fn answer_from_unknown_peer_is_ignored() {
        let core = MeshCore::new("alice".to_owned(), "R1".to_owned(), Channel::Webrtc);
        let applied = core
            .accept_answer("ghost", RTCSessionDescription::default())
            .await
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(core.state("ghost"), PeerState::NoConnection);
    }
}
