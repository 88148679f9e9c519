//! Capacity-bounded set of transport peers.
//!
//! # Link lifecycle
//!
//! ```text
//!                 signal (unknown id)
//!   Unconnected ───────────────────────► PendingInbound
//!        │                                    │ accept_incoming
//!        │ connect                            │ (capacity checked)
//!        ▼                                    ▼
//!    Signaling ◄──────────────────────────────┘
//!        │ transport: Connected
//!        ▼
//!    Connected
//!        │ transport: Closed / Error
//!        ▼
//!     Closed  (link removed; a new connect opens a fresh link)
//! ```
//!
//! Both entry points into `Signaling` go through the same capacity check.
//! A failing peer is removed on its own and never touches the other links.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ReceiverConfig;
use crate::error::{Error, Result};
use crate::transport::{
    LinkId, MediaStream, PeerEvent, PeerEventKind, PeerEventSender, PeerOptions, SignalPayload,
    Transport, TransportPeer,
};

/// State of a live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake in progress through the signaling relay.
    Signaling,
    /// Data channel open.
    Connected,
    /// Closed or failed. Terminal for the link object.
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signaling => write!(f, "Signaling"),
            Self::Connected => write!(f, "Connected"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Where an offered signal went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRoute {
    /// Fed into the live transport peer.
    Delivered,
    /// Queued for an inbound connection that has not been accepted yet.
    Pending,
}

/// Result of feeding a transport event through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Event belongs to no live link and was dropped.
    Ignored,
    /// Event accepted, state unchanged.
    Unchanged(LinkState),
    /// Link moved from one state to another.
    Moved { from: LinkState, to: LinkState },
}

impl Transition {
    /// Whether the event came from a live link.
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

struct Link {
    id: LinkId,
    state: LinkState,
    initiator: bool,
    peer: Box<dyn TransportPeer>,
}

/// Owns every transport peer of one receiver.
pub struct PeerConnectionManager {
    self_id: String,
    max_peers: usize,
    max_pending_inbound: usize,
    max_pending_signals: usize,
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedSender<PeerEvent>,
    links: HashMap<String, Link>,
    /// Signals from peers we have not accepted yet, in arrival order.
    pending: HashMap<String, Vec<SignalPayload>>,
    local_stream: Option<MediaStream>,
    next_link: u64,
}

impl PeerConnectionManager {
    /// Create a manager that opens links on `transport` and reports their
    /// events on `events`.
    pub fn new(
        self_id: impl Into<String>,
        config: &ReceiverConfig,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            max_peers: config.max_peers,
            max_pending_inbound: config.max_pending_inbound,
            max_pending_signals: config.max_pending_signals,
            transport,
            events,
            links: HashMap::new(),
            pending: HashMap::new(),
            local_stream: None,
            next_link: 0,
        }
    }

    /// Media offered to links opened from now on.
    pub fn set_local_stream(&mut self, stream: Option<MediaStream>) {
        self.local_stream = stream;
    }

    /// Open a link to `peer_id`.
    ///
    /// Signals already queued from that peer are replayed into the new link.
    pub fn connect(&mut self, peer_id: &str, initiator: bool) -> Result<()> {
        let queued = self.pending.remove(peer_id).unwrap_or_default();
        match self.open_link(peer_id, initiator, &queued) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !queued.is_empty() {
                    self.pending.insert(peer_id.to_string(), queued);
                }
                Err(e)
            }
        }
    }

    /// Accept a pending inbound connection as the non-initiating side.
    pub fn accept_incoming(&mut self, peer_id: &str) -> Result<()> {
        let Some(queued) = self.pending.remove(peer_id) else {
            return Err(Error::NotPending(peer_id.to_string()));
        };
        if let Err(e) = self.open_link(peer_id, false, &queued) {
            self.pending.insert(peer_id.to_string(), queued);
            return Err(e);
        }
        Ok(())
    }

    /// Drop a pending inbound connection and its queued signals.
    pub fn reject_incoming(&mut self, peer_id: &str) -> bool {
        let rejected = self.pending.remove(peer_id).is_some();
        if rejected {
            debug!(peer_id, "Rejected inbound connection");
        }
        rejected
    }

    /// Route a signal from the relay.
    ///
    /// Known peers get it immediately. Unknown peers are parked in the pending
    /// inbound table; no transport resource is created for them. Both the
    /// table and each peer's queue are bounded.
    pub fn offer_signal(&mut self, peer_id: &str, payload: SignalPayload) -> Result<SignalRoute> {
        if peer_id == self.self_id {
            return Err(Error::SelfConnection(peer_id.to_string()));
        }

        if let Some(link) = self.links.get_mut(peer_id) {
            trace!(peer_id, link = %link.id, "Delivering signal");
            link.peer.signal(payload)?;
            return Ok(SignalRoute::Delivered);
        }

        if let Some(queue) = self.pending.get_mut(peer_id) {
            if queue.len() >= self.max_pending_signals {
                warn!(
                    peer_id,
                    max = self.max_pending_signals,
                    "Pending signal queue full, dropping signal"
                );
                return Err(Error::PendingSignalsFull {
                    peer_id: peer_id.to_string(),
                    max: self.max_pending_signals,
                });
            }
            queue.push(payload);
            return Ok(SignalRoute::Pending);
        }

        if self.pending.len() >= self.max_pending_inbound {
            warn!(
                peer_id,
                max = self.max_pending_inbound,
                "Pending inbound table full, dropping signal"
            );
            return Err(Error::PendingInboundFull(self.max_pending_inbound));
        }

        info!(peer_id, "Inbound connection pending");
        self.pending.insert(peer_id.to_string(), vec![payload]);
        Ok(SignalRoute::Pending)
    }

    /// Apply a transport event to the link state machine.
    ///
    /// Closed and errored links are removed here.
    pub fn handle_event(&mut self, event: &PeerEvent) -> Transition {
        let Some(link) = self.links.get_mut(&event.peer_id) else {
            trace!(peer_id = %event.peer_id, link = %event.link, "Event for unknown peer");
            return Transition::Ignored;
        };
        if link.id != event.link {
            trace!(
                peer_id = %event.peer_id,
                event_link = %event.link,
                live_link = %link.id,
                "Event from replaced link"
            );
            return Transition::Ignored;
        }

        match &event.kind {
            PeerEventKind::Connected => {
                let from = link.state;
                if from == LinkState::Connected {
                    return Transition::Unchanged(from);
                }
                link.state = LinkState::Connected;
                info!(peer_id = %event.peer_id, link = %link.id, initiator = link.initiator, "Peer connected");
                Transition::Moved { from, to: LinkState::Connected }
            }
            PeerEventKind::Closed | PeerEventKind::Error(_) => {
                let from = link.state;
                if let PeerEventKind::Error(reason) = &event.kind {
                    warn!(peer_id = %event.peer_id, link = %link.id, %reason, "Peer connection error");
                } else {
                    info!(peer_id = %event.peer_id, link = %link.id, "Peer closed");
                }
                if let Some(mut link) = self.links.remove(&event.peer_id) {
                    link.peer.close();
                }
                Transition::Moved { from, to: LinkState::Closed }
            }
            PeerEventKind::Signal(_) | PeerEventKind::Stream(_) | PeerEventKind::Data(_) => {
                Transition::Unchanged(link.state)
            }
        }
    }

    /// Send to every connected peer. Returns how many sends were accepted.
    ///
    /// Per-peer failures are logged and do not stop the fan-out.
    pub fn broadcast(&mut self, data: &Bytes) -> usize {
        let mut sent = 0;
        for (peer_id, link) in &mut self.links {
            if link.state != LinkState::Connected {
                continue;
            }
            match link.peer.send(data.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Broadcast send failed"),
            }
        }
        trace!(sent, bytes = data.len(), "Broadcast");
        sent
    }

    /// Send to one connected peer.
    pub fn send_to(&mut self, peer_id: &str, data: Bytes) -> Result<()> {
        let link = self
            .links
            .get_mut(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        if link.state != LinkState::Connected {
            return Err(Error::Connection {
                peer_id: peer_id.to_string(),
                reason: format!("link is {}", link.state),
            });
        }
        link.peer.send(data)
    }

    /// Close and forget one link. Returns whether it existed.
    pub fn close_peer(&mut self, peer_id: &str) -> bool {
        match self.links.remove(peer_id) {
            Some(mut link) => {
                debug!(peer_id, link = %link.id, "Closing peer");
                link.peer.close();
                true
            }
            None => false,
        }
    }

    /// Close every link and drop every pending inbound connection.
    pub fn disconnect_all(&mut self) -> usize {
        let closed = self.links.len();
        for (peer_id, mut link) in self.links.drain() {
            debug!(peer_id = %peer_id, link = %link.id, "Closing peer");
            link.peer.close();
        }
        self.pending.clear();
        if closed > 0 {
            info!(closed, "Disconnected all peers");
        }
        closed
    }

    pub fn state(&self, peer_id: &str) -> Option<LinkState> {
        self.links.get(peer_id).map(|l| l.state)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.state(peer_id) == Some(LinkState::Connected)
    }

    /// Live links, signaling or connected.
    pub fn live_count(&self) -> usize {
        self.links.len()
    }

    pub fn connected_count(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.state == LinkState::Connected)
            .count()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Peer ids waiting for `accept_incoming`, sorted.
    pub fn pending_inbound(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn open_link(&mut self, peer_id: &str, initiator: bool, queued: &[SignalPayload]) -> Result<()> {
        if peer_id == self.self_id {
            return Err(Error::SelfConnection(peer_id.to_string()));
        }
        if self.links.contains_key(peer_id) {
            return Err(Error::AlreadyConnected(peer_id.to_string()));
        }
        if self.links.len() >= self.max_peers {
            warn!(
                peer_id,
                live = self.links.len(),
                max = self.max_peers,
                "Peer capacity reached, refusing connection"
            );
            return Err(Error::CapacityExceeded {
                live: self.links.len(),
                max: self.max_peers,
            });
        }

        let id = LinkId(self.next_link);
        self.next_link += 1;

        let options = PeerOptions {
            peer_id: peer_id.to_string(),
            initiator,
            local_stream: self.local_stream.clone(),
        };
        let sender = PeerEventSender::new(peer_id.to_string(), id, self.events.clone());
        let mut peer = self.transport.open(options, sender)?;

        for payload in queued {
            if let Err(e) = peer.signal(payload.clone()) {
                warn!(peer_id, link = %id, error = %e, "Replaying queued signal failed");
                peer.close();
                return Err(e);
            }
        }

        info!(peer_id, link = %id, initiator, replayed = queued.len(), "Opened peer link");
        self.links.insert(
            peer_id.to_string(),
            Link {
                id,
                state: LinkState::Signaling,
                initiator,
                peer,
            },
        );
        Ok(())
    }
}
