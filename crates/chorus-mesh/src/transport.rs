//! Transport abstraction and the per-peer lifecycle event channel.
//!
//! A transport peer is one bidirectional byte channel to a single remote node
//! (a WebRTC data channel in a browser deployment). Its lifecycle is reported
//! back as tagged [`PeerEvent`]s through one channel per receiver, consumed by
//! a single dispatcher.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Result;

/// Opaque connection-setup payload, relayed verbatim between two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Opaque handle to a media stream. Media itself is handled elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Identifies one transport peer object.
///
/// A reconnect to the same peer id gets a new link id, so events still in
/// flight from a closed object can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// What happened on a transport peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// Setup payload to relay to the remote side.
    Signal(SignalPayload),
    /// Remote media stream attached.
    Stream(MediaStream),
    /// Channel established.
    Connected,
    /// Bytes received.
    Data(Bytes),
    /// Channel closed.
    Closed,
    /// Channel failed.
    Error(String),
}

/// A lifecycle event from one transport peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer_id: String,
    pub link: LinkId,
    pub kind: PeerEventKind,
}

/// Per-peer handle a transport uses to report events.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    peer_id: String,
    link: LinkId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSender {
    pub(crate) fn new(peer_id: String, link: LinkId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { peer_id, link, tx }
    }

    /// The remote peer this sender reports for.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn signal(&self, payload: SignalPayload) {
        self.emit(PeerEventKind::Signal(payload));
    }

    pub fn stream(&self, stream: MediaStream) {
        self.emit(PeerEventKind::Stream(stream));
    }

    pub fn connected(&self) {
        self.emit(PeerEventKind::Connected);
    }

    pub fn data(&self, data: Bytes) {
        self.emit(PeerEventKind::Data(data));
    }

    pub fn closed(&self) {
        self.emit(PeerEventKind::Closed);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(PeerEventKind::Error(reason.into()));
    }

    fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            peer_id: self.peer_id.clone(),
            link: self.link,
            kind,
        };
        if self.tx.send(event).is_err() {
            // Receiver dropped; nobody is listening anymore
            trace!(peer_id = %self.peer_id, link = %self.link, "Dropping event for closed receiver");
        }
    }
}

/// Parameters for opening a transport peer.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub peer_id: String,
    /// Whether this side starts the handshake.
    pub initiator: bool,
    /// Local media to offer the remote side.
    pub local_stream: Option<MediaStream>,
}

/// One live channel to a remote peer.
pub trait TransportPeer: Send {
    /// Feed a setup payload received from the remote side via the relay.
    fn signal(&mut self, payload: SignalPayload) -> Result<()>;

    /// Send bytes to the remote side. Fire-and-forget.
    fn send(&mut self, data: Bytes) -> Result<()>;

    /// Tear down the channel. Must be idempotent.
    fn close(&mut self);
}

/// Factory for transport peers.
pub trait Transport: Send {
    /// Open a new transport peer that reports through `events`.
    fn open(&self, options: PeerOptions, events: PeerEventSender) -> Result<Box<dyn TransportPeer>>;
}
