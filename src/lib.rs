#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Skyrelay
//! Skyrelay is a WebRTC signaling and media relay core. It negotiates SDP offers and answers for browser
//! peers, forwards a publisher's video to its subscribers, and runs room based websocket signaling.
//! Devices that are not browsers, such as a UAV, join the same rooms with the mesh clients and stream
//! H.264 from a camera over data channel negotiated peer connections.
//!
//! The `skyrelay-server` binary serves the HTTP and websocket endpoints; `skyrelay-uav` is a controller
//! that joins a room as master.

/// Negotiates media calls and wires publishers to subscribers.
pub mod call;
/// Configuration for [`call::CallOrchestrator`] and the mesh clients.
pub mod config;
/// Reacts to camera commands and media requests received over the data channel.
pub mod controller;
pub mod error;
/// H.264 demuxing and media sources.
pub mod media;
/// Peer to peer data channel and video clients.
pub mod mesh;
/// Forwarding of a published remote track.
pub mod publisher;
/// Order independent handoff of published tracks.
pub mod routing;
/// Envelopes, rooms and the HTTP/websocket endpoints.
pub mod signaling;
/// Forwarding of a published track to one receiver.
pub mod subscriber;
