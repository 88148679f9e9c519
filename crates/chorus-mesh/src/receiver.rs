//! The collective receiver: one node's view of the mesh.
//!
//! [`CollectiveReceiver`] owns the peer links and the participant table and
//! is the only way to mutate either. All mutation happens on the owner's
//! thread through `&mut self`; transport peers report back through a channel
//! that the owner drains with [`pump`](CollectiveReceiver::pump) or
//! [`next_event`](CollectiveReceiver::next_event).
//!
//! # Data flow
//!
//! ```text
//! inbound:  PeerEvent::Data ─► decode ─► store.apply ─► recompute ─► on_field_update
//! outbound: update_self_state ─► store.apply ─► recompute ─► on_field_update
//!                                                        └─► encode ─► broadcast
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chorus_field::{
    now_millis, CollectiveField, MetricsUpdate, ParticipantState, ParticipantStateStore,
    UpdateOutcome,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{IncomingPolicy, ReceiverConfig};
use crate::error::{Error, Result};
use crate::peer_manager::{LinkState, PeerConnectionManager, SignalRoute, Transition};
use crate::transport::{MediaStream, PeerEvent, PeerEventKind, SignalPayload, Transport};
use crate::wire::{self, Inbound, MeshMessage};

type FieldCallback = Box<dyn Fn(&CollectiveField) + Send>;
type SignalCallback = Box<dyn Fn(&str, &SignalPayload) + Send>;
type StreamCallback = Box<dyn Fn(&str, &MediaStream) + Send>;

/// A node in the Chorus mesh.
pub struct CollectiveReceiver {
    self_id: String,
    config: ReceiverConfig,
    peers: PeerConnectionManager,
    store: ParticipantStateStore,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    /// Local time (unix millis) each link was opened or its peer last heard from.
    last_heard: HashMap<String, u64>,
    /// Never reset, so peers never see our sequence go backwards.
    self_seq: u64,
    on_field_update: Option<FieldCallback>,
    on_signal: Option<SignalCallback>,
    on_stream: Option<StreamCallback>,
}

impl CollectiveReceiver {
    /// Create a receiver with the default configuration.
    ///
    /// The field starts with only the local participant, zero-valued.
    pub fn new(self_id: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::build(self_id.into(), ReceiverConfig::default(), Box::new(transport))
    }

    /// Create a receiver with an explicit configuration.
    pub fn with_config(
        self_id: impl Into<String>,
        config: ReceiverConfig,
        transport: impl Transport + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(self_id.into(), config, Box::new(transport)))
    }

    fn build(self_id: String, config: ReceiverConfig, transport: Box<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let peers = PeerConnectionManager::new(self_id.clone(), &config, transport, tx);
        let store = ParticipantStateStore::with_participant(ParticipantState::new(self_id.clone()));

        debug!(
            self_id = %self_id,
            max_peers = config.max_peers,
            incoming = ?config.incoming,
            stale_after = ?config.stale_after,
            "Created collective receiver"
        );

        Self {
            self_id,
            config,
            peers,
            store,
            events: rx,
            last_heard: HashMap::new(),
            self_seq: 0,
            on_field_update: None,
            on_signal: None,
            on_stream: None,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// The current collective field.
    pub fn field(&self) -> &CollectiveField {
        self.store.field()
    }

    /// Stored state of one participant.
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantState> {
        self.store.get(user_id)
    }

    /// Called with the new field after every change to it.
    pub fn on_field_update<F>(&mut self, callback: F)
    where
        F: Fn(&CollectiveField) + Send + 'static,
    {
        self.on_field_update = Some(Box::new(callback));
    }

    /// Called with `(peer_id, payload)` for every signal to relay.
    pub fn on_signal<F>(&mut self, callback: F)
    where
        F: Fn(&str, &SignalPayload) + Send + 'static,
    {
        self.on_signal = Some(Box::new(callback));
    }

    /// Called with `(peer_id, stream)` when a remote media stream attaches.
    pub fn on_stream<F>(&mut self, callback: F)
    where
        F: Fn(&str, &MediaStream) + Send + 'static,
    {
        self.on_stream = Some(Box::new(callback));
    }

    /// Media offered to links opened from now on.
    pub fn set_local_stream(&mut self, stream: Option<MediaStream>) {
        self.peers.set_local_stream(stream);
    }

    /// Open a link to `peer_id`.
    ///
    /// Fails with [`Error::CapacityExceeded`] when `max_peers` links are live.
    pub fn connect(&mut self, peer_id: &str, initiator: bool) -> Result<()> {
        self.peers.connect(peer_id, initiator)?;
        self.last_heard.insert(peer_id.to_string(), now_millis());
        self.ensure_self();
        Ok(())
    }

    /// Hand a signal from the relay to the link for `peer_id`.
    ///
    /// Signals from unknown peers wait in the pending inbound table unless
    /// the config auto-accepts them.
    pub fn signal(&mut self, peer_id: &str, payload: SignalPayload) -> Result<SignalRoute> {
        let route = self.peers.offer_signal(peer_id, payload)?;
        if route == SignalRoute::Pending && self.config.incoming == IncomingPolicy::AutoAccept {
            if let Err(e) = self.accept_incoming(peer_id) {
                self.peers.reject_incoming(peer_id);
                return Err(e);
            }
            return Ok(SignalRoute::Delivered);
        }
        Ok(route)
    }

    /// Accept a pending inbound connection. Capacity checked like `connect`.
    pub fn accept_incoming(&mut self, peer_id: &str) -> Result<()> {
        self.peers.accept_incoming(peer_id)?;
        self.last_heard.insert(peer_id.to_string(), now_millis());
        self.ensure_self();
        Ok(())
    }

    /// Drop a pending inbound connection.
    pub fn reject_incoming(&mut self, peer_id: &str) -> bool {
        self.peers.reject_incoming(peer_id)
    }

    /// Peers waiting for `accept_incoming`.
    pub fn pending_inbound(&self) -> Vec<String> {
        self.peers.pending_inbound()
    }

    /// Apply a partial change to the local participant and broadcast the
    /// resulting full state. Returns how many peers it was sent to.
    ///
    /// The local field reflects the change before anything is sent. NaN or
    /// infinite values fail with [`Error::InvalidMetric`]
    /// and change nothing.
    pub fn update_self_state(&mut self, update: MetricsUpdate) -> Result<usize> {
        if let Some(metric) = update.non_finite_metric() {
            warn!(metric, "Refusing non-finite self metric");
            return Err(Error::InvalidMetric(metric));
        }

        let mut state = self
            .store
            .get(&self.self_id)
            .cloned()
            .unwrap_or_else(|| ParticipantState::new(self.self_id.clone()));
        state.apply_update(&update);
        state.user_id = self.self_id.clone();
        state.last_update = now_millis();
        self.self_seq += 1;
        state.seq = self.self_seq;

        self.store.apply(state.clone());
        self.publish_field();

        let sent = self.broadcast(&MeshMessage::StateUpdate(state))?;
        trace!(seq = self.self_seq, sent, "Broadcast self state");
        Ok(sent)
    }

    /// Send a message to every connected peer. Returns how many accepted it.
    pub fn broadcast(&mut self, message: &MeshMessage) -> Result<usize> {
        let bytes = wire::encode(message)?;
        Ok(self.peers.broadcast(&bytes))
    }

    /// Send raw bytes to every connected peer.
    pub fn broadcast_bytes(&mut self, data: Bytes) -> usize {
        self.peers.broadcast(&data)
    }

    /// Close every link, drop all pending inbound connections and clear the
    /// participant table, self included.
    ///
    /// The next `connect`, `accept_incoming` or `update_self_state` starts a
    /// fresh session with a zero-valued self entry.
    pub fn disconnect(&mut self) {
        let closed = self.peers.disconnect_all();
        self.last_heard.clear();
        self.store.clear();
        info!(self_id = %self.self_id, closed, "Disconnected from mesh");
        self.publish_field();
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<LinkState> {
        self.peers.state(peer_id)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.is_connected(peer_id)
    }

    pub fn connected_count(&self) -> usize {
        self.peers.connected_count()
    }

    /// Links that are signaling or connected.
    pub fn live_count(&self) -> usize {
        self.peers.live_count()
    }

    /// Handle every event already queued by transport peers.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for the next transport event.
    ///
    /// Pass it to [`handle_event`](Self::handle_event). The receiver keeps a
    /// sender of its own, so this only returns `None` if that invariant breaks.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Dispatch one transport event.
    ///
    /// Never fails: per-peer problems are logged and contained to that peer.
    pub fn handle_event(&mut self, event: PeerEvent) {
        let transition = self.peers.handle_event(&event);
        if !transition.accepted() {
            return;
        }
        let PeerEvent { peer_id, kind, .. } = event;

        match kind {
            PeerEventKind::Signal(payload) => match &self.on_signal {
                Some(callback) => callback(&peer_id, &payload),
                None => warn!(peer_id = %peer_id, "No signal relay attached, dropping signal"),
            },
            PeerEventKind::Stream(stream) => {
                debug!(peer_id = %peer_id, stream = %stream.id, "Remote stream attached");
                if let Some(callback) = &self.on_stream {
                    callback(&peer_id, &stream);
                }
            }
            PeerEventKind::Connected => {
                self.last_heard.insert(peer_id.clone(), now_millis());
                if let Transition::Moved { .. } = transition {
                    self.send_self_state_to(&peer_id);
                }
            }
            PeerEventKind::Data(data) => {
                if let Err(e) = self.receive(&peer_id, &data) {
                    warn!(peer_id = %peer_id, error = %e, bytes = data.len(), "Dropping inbound message");
                }
            }
            PeerEventKind::Closed | PeerEventKind::Error(_) => {
                self.forget_peer(&peer_id);
            }
        }
    }

    /// Inbound dispatcher for bytes received from `from`.
    ///
    /// `from` must be a connected peer, so whatever it reports is evicted
    /// again when its link closes. Unknown message types are ignored.
    /// Undecodable bytes return [`Error::MalformedMessage`] and leave all
    /// state untouched.
    pub fn receive(&mut self, from: &str, data: &[u8]) -> Result<()> {
        match self.peers.state(from) {
            Some(LinkState::Connected) => {}
            Some(state) => {
                return Err(Error::Connection {
                    peer_id: from.to_string(),
                    reason: format!("link is {state}"),
                })
            }
            None => return Err(Error::UnknownPeer(from.to_string())),
        }
        self.last_heard.insert(from.to_string(), now_millis());

        match wire::decode(data)? {
            Inbound::Message(MeshMessage::StateUpdate(state)) => {
                self.apply_remote_state(from, state);
                Ok(())
            }
            Inbound::Unknown(kind) => {
                debug!(peer_id = from, kind = %kind, "Ignoring unknown message type");
                Ok(())
            }
        }
    }

    /// Evict remote participants not heard from within `stale_after`, and
    /// close links still signaling that long after they were opened.
    pub fn prune_stale(&mut self) -> Vec<String> {
        self.prune_stale_at(now_millis())
    }

    /// [`prune_stale`](Self::prune_stale) against an explicit clock.
    ///
    /// Evicted peers lose their link, freeing capacity.
    pub fn prune_stale_at(&mut self, now: u64) -> Vec<String> {
        let Some(after) = self.config.stale_after else {
            return Vec::new();
        };
        let cutoff = now.saturating_sub(duration_millis(after));

        let mut expired: Vec<String> = self
            .last_heard
            .iter()
            .filter(|(_, heard)| **heard < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        expired.sort();

        for peer_id in &expired {
            info!(peer_id = %peer_id, link = ?self.peers.state(peer_id), "Evicting silent peer");
            self.last_heard.remove(peer_id);
            self.peers.close_peer(peer_id);
            self.store.remove(peer_id);
        }
        self.publish_field();
        expired
    }

    fn apply_remote_state(&mut self, from: &str, state: ParticipantState) {
        if state.user_id == self.self_id {
            warn!(peer_id = from, "Peer sent a state claiming our own id, dropping");
            return;
        }
        if state.user_id != from {
            warn!(
                peer_id = from,
                claimed = %state.user_id,
                "State update for a different participant, dropping"
            );
            return;
        }

        match self.store.apply(state) {
            UpdateOutcome::Stale | UpdateOutcome::Invalid => {}
            outcome => {
                if outcome == UpdateOutcome::Inserted {
                    debug!(peer_id = from, node_count = self.store.len(), "New participant");
                }
                self.publish_field();
            }
        }
    }

    fn forget_peer(&mut self, peer_id: &str) {
        self.last_heard.remove(peer_id);
        if self.store.remove(peer_id).is_some() {
            debug!(peer_id, node_count = self.store.len(), "Removed participant of closed peer");
            self.publish_field();
        }
    }

    /// Bring a newly connected peer up to date without waiting for our next
    /// metric change.
    fn send_self_state_to(&mut self, peer_id: &str) {
        let Some(state) = self.store.get(&self.self_id).cloned() else {
            return;
        };
        let result = wire::encode(&MeshMessage::StateUpdate(state))
            .and_then(|bytes| self.peers.send_to(peer_id, bytes));
        if let Err(e) = result {
            warn!(peer_id, error = %e, "Failed to send self state to new peer");
        }
    }

    /// Re-seed the zero-valued self entry after a `disconnect`.
    fn ensure_self(&mut self) {
        if !self.store.contains(&self.self_id) {
            let mut state = ParticipantState::new(self.self_id.clone());
            state.seq = self.self_seq;
            self.store.apply(state);
            self.publish_field();
        }
    }

    fn publish_field(&self) {
        if let Some(callback) = &self.on_field_update {
            callback(self.store.field());
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for CollectiveReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveReceiver")
            .field("self_id", &self.self_id)
            .field("live", &self.peers.live_count())
            .field("node_count", &self.store.len())
            .finish_non_exhaustive()
    }
}
