//! In-process transport and signaling relay.
//!
//! [`MemoryNetwork`] connects any number of receivers living in one process.
//! It follows the same offer/answer shape as a browser data channel:
//!
//! ```text
//!   A (initiator)              relay               B
//!   open ──► Signal{offer} ──────────────► signal(A, offer)
//!                                          accept → open
//!   signal(B, answer) ◄───────────────── Signal{answer}
//!   Connected                              Connected
//! ```
//!
//! If both sides open as initiator, the offers cross. The side with the
//! higher id drops its own offer and answers; the lower id keeps waiting for
//! that answer.
//!
//! [`SignalRelay`] stands in for the external signaling server: it collects
//! what each receiver wants relayed and hands it back for delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::receiver::CollectiveReceiver;
use crate::transport::{
    LinkId, MediaStream, PeerEventSender, PeerOptions, SignalPayload, Transport, TransportPeer,
};

const OFFER: &str = "offer";
const ANSWER: &str = "answer";

struct Endpoint {
    link: LinkId,
    events: PeerEventSender,
    local_stream: Option<MediaStream>,
    connected: bool,
}

/// (local, remote) → local side's endpoint.
type Registry = HashMap<(String, String), Endpoint>;

/// A shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport for the node `local_id`.
    pub fn transport(&self, local_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            local_id: local_id.into(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Fail the link between `a` and `b` on both ends, as a dropped network
    /// path would.
    pub fn sever(&self, a: &str, b: &str) -> bool {
        let mut registry = lock(&self.registry);
        let mut severed = false;
        for key in [(a.to_string(), b.to_string()), (b.to_string(), a.to_string())] {
            if let Some(endpoint) = registry.remove(&key) {
                endpoint.events.error("link severed");
                severed = true;
            }
        }
        if severed {
            debug!(a, b, "Severed memory link");
        }
        severed
    }

    /// Number of open endpoints (two per established link).
    pub fn endpoint_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`Transport`] for one node of a [`MemoryNetwork`].
pub struct MemoryTransport {
    local_id: String,
    registry: Arc<Mutex<Registry>>,
}

impl Transport for MemoryTransport {
    fn open(&self, options: PeerOptions, events: PeerEventSender) -> Result<Box<dyn TransportPeer>> {
        let key = (self.local_id.clone(), options.peer_id.clone());
        let link = events.link();

        if options.initiator {
            events.signal(SignalPayload::new(json!({ "type": OFFER, "from": self.local_id })));
        }

        lock(&self.registry).insert(
            key,
            Endpoint {
                link,
                events,
                local_stream: options.local_stream,
                connected: false,
            },
        );

        Ok(Box::new(MemoryPeer {
            local_id: self.local_id.clone(),
            remote_id: options.peer_id,
            link,
            initiator: options.initiator,
            registry: Arc::clone(&self.registry),
            closed: false,
        }))
    }
}

struct MemoryPeer {
    local_id: String,
    remote_id: String,
    link: LinkId,
    initiator: bool,
    registry: Arc<Mutex<Registry>>,
    closed: bool,
}

impl MemoryPeer {
    fn local_key(&self) -> (String, String) {
        (self.local_id.clone(), self.remote_id.clone())
    }

    fn remote_key(&self) -> (String, String) {
        (self.remote_id.clone(), self.local_id.clone())
    }

    fn failure(&self, reason: &str) -> Error {
        Error::Connection {
            peer_id: self.remote_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Answer an offer from the remote side.
    fn answer(&self) -> Result<()> {
        let registry = lock(&self.registry);
        match registry.get(&self.local_key()) {
            Some(endpoint) => {
                endpoint
                    .events
                    .signal(SignalPayload::new(json!({ "type": ANSWER, "from": self.local_id })));
                Ok(())
            }
            None => Err(self.failure("link no longer registered")),
        }
    }

    /// Initiator side: the answer arrived, so both ends are up.
    fn establish(&self) -> Result<()> {
        let mut registry = lock(&self.registry);

        let remote_stream = match registry.get_mut(&self.remote_key()) {
            Some(remote) => {
                remote.connected = true;
                remote.local_stream.clone()
            }
            None => return Err(self.failure("answer from peer without endpoint")),
        };
        let local_stream = match registry.get_mut(&self.local_key()) {
            Some(local) if local.link == self.link => {
                local.connected = true;
                local.local_stream.clone()
            }
            _ => return Err(self.failure("link no longer registered")),
        };

        for (key, stream) in [(self.local_key(), remote_stream), (self.remote_key(), local_stream)] {
            if let Some(endpoint) = registry.get(&key) {
                endpoint.events.connected();
                if let Some(stream) = stream {
                    endpoint.events.stream(stream);
                }
            }
        }
        debug!(local = %self.local_id, remote = %self.remote_id, "Memory link established");
        Ok(())
    }
}

impl TransportPeer for MemoryPeer {
    fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        if self.closed {
            return Err(self.failure("link closed"));
        }
        let kind = payload.as_value().get("type").and_then(|v| v.as_str());
        match (self.initiator, kind) {
            (false, Some(OFFER)) => self.answer(),
            (true, Some(OFFER)) if self.local_id > self.remote_id => {
                debug!(local = %self.local_id, remote = %self.remote_id, "Crossed offers, answering");
                self.initiator = false;
                self.answer()
            }
            (true, Some(OFFER)) => {
                debug!(local = %self.local_id, remote = %self.remote_id, "Crossed offers, waiting for answer");
                Ok(())
            }
            (true, Some(ANSWER)) => self.establish(),
            _ => {
                warn!(remote = %self.remote_id, ?kind, initiator = self.initiator, "Unexpected signal");
                Err(self.failure("unexpected signal"))
            }
        }
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        if self.closed {
            return Err(self.failure("link closed"));
        }
        let registry = lock(&self.registry);
        let local_up = registry
            .get(&self.local_key())
            .is_some_and(|e| e.link == self.link && e.connected);
        if !local_up {
            return Err(self.failure("not connected"));
        }
        match registry.get(&self.remote_key()) {
            Some(remote) if remote.connected => {
                trace!(from = %self.local_id, to = %self.remote_id, bytes = data.len(), "Memory send");
                remote.events.data(data);
                Ok(())
            }
            _ => Err(self.failure("remote endpoint gone")),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut registry = lock(&self.registry);
        let local_key = self.local_key();
        if registry.get(&local_key).is_some_and(|e| e.link == self.link) {
            registry.remove(&local_key);
        }
        // The remote end learns about it as a close, not an error. Its
        // endpoint stays until its own side closes.
        if let Some(remote) = registry.get_mut(&self.remote_key()) {
            remote.connected = false;
            remote.events.closed();
        }
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.close();
    }
}

/// A signal waiting to be relayed.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedSignal {
    pub from: String,
    pub to: String,
    pub payload: SignalPayload,
}

/// In-process stand-in for the signaling relay.
#[derive(Clone, Default)]
pub struct SignalRelay {
    queue: Arc<Mutex<VecDeque<RelayedSignal>>>,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `receiver`'s outgoing signals into this relay.
    pub fn attach(&self, receiver: &mut CollectiveReceiver) {
        let queue = Arc::clone(&self.queue);
        let from = receiver.self_id().to_string();
        receiver.on_signal(move |to, payload| {
            queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_back(RelayedSignal {
                    from: from.clone(),
                    to: to.to_string(),
                    payload: payload.clone(),
                });
        });
    }

    /// Take every queued signal, oldest first.
    pub fn drain(&self) -> Vec<RelayedSignal> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }
}

/// Run every receiver's event loop and the relay until nothing is left to do.
///
/// Returns the number of events and signals processed. Signals addressed to
/// receivers not in `receivers` are dropped.
pub fn settle(receivers: &mut [CollectiveReceiver], relay: &SignalRelay) -> usize {
    const MAX_ROUNDS: usize = 64;

    let mut total = 0;
    for _ in 0..MAX_ROUNDS {
        let mut moved = 0;
        for receiver in receivers.iter_mut() {
            moved += receiver.pump();
        }
        for signal in relay.drain() {
            moved += 1;
            match receivers.iter_mut().find(|r| r.self_id() == signal.to) {
                Some(target) => {
                    if let Err(e) = target.signal(&signal.from, signal.payload) {
                        warn!(from = %signal.from, to = %signal.to, error = %e, "Relayed signal refused");
                    }
                }
                None => trace!(to = %signal.to, "No receiver for relayed signal"),
            }
        }
        if moved == 0 {
            break;
        }
        total += moved;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PeerEvent, PeerEventKind};
    use tokio::sync::mpsc;

    fn sender(peer: &str, link: u64) -> (PeerEventSender, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerEventSender::new(peer.into(), LinkId(link), tx), rx)
    }

    fn options(peer: &str, initiator: bool) -> PeerOptions {
        PeerOptions {
            peer_id: peer.into(),
            initiator,
            local_stream: None,
        }
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEventKind> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.kind);
        }
        out
    }

    #[test]
    fn offer_answer_handshake() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = sender("b", 0);
        let (b_tx, mut b_rx) = sender("a", 0);

        let mut a = net.transport("a").open(options("b", true), a_tx).unwrap();
        let offer = match kinds(&mut a_rx).pop() {
            Some(PeerEventKind::Signal(p)) => p,
            other => panic!("expected offer, got {other:?}"),
        };
        assert_eq!(offer.as_value()["type"], "offer");

        let mut b = net.transport("b").open(options("a", false), b_tx).unwrap();
        b.signal(offer).unwrap();
        let answer = match kinds(&mut b_rx).pop() {
            Some(PeerEventKind::Signal(p)) => p,
            other => panic!("expected answer, got {other:?}"),
        };

        // Nothing flows before the handshake completes
        assert!(a.send(Bytes::from_static(b"early")).is_err());

        a.signal(answer).unwrap();
        assert_eq!(kinds(&mut a_rx), vec![PeerEventKind::Connected]);
        assert_eq!(kinds(&mut b_rx), vec![PeerEventKind::Connected]);

        a.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(kinds(&mut b_rx), vec![PeerEventKind::Data(Bytes::from_static(b"hello"))]);
        b.send(Bytes::from_static(b"back")).unwrap();
        assert_eq!(kinds(&mut a_rx), vec![PeerEventKind::Data(Bytes::from_static(b"back"))]);

        a.close();
        assert_eq!(kinds(&mut b_rx), vec![PeerEventKind::Closed]);
        assert!(b.send(Bytes::from_static(b"late")).is_err());
        assert_eq!(net.endpoint_count(), 1);

        b.close();
        assert!(kinds(&mut a_rx).is_empty());
        assert_eq!(net.endpoint_count(), 0);
    }

    #[test]
    fn unexpected_signal_is_rejected() {
        let net = MemoryNetwork::new();
        let (tx, _rx) = sender("b", 0);
        let mut b = net.transport("b").open(options("a", false), tx).unwrap();
        let bogus = SignalPayload::new(json!({ "type": "answer" }));
        assert!(matches!(b.signal(bogus), Err(Error::Connection { .. })));
        let bogus = SignalPayload::new(json!({ "type": "candidate" }));
        assert!(matches!(b.signal(bogus), Err(Error::Connection { .. })));
    }

    #[test]
    fn crossed_offers_resolve_by_id() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = sender("b", 0);
        let (b_tx, mut b_rx) = sender("a", 0);
        let mut a = net.transport("a").open(options("b", true), a_tx).unwrap();
        let mut b = net.transport("b").open(options("a", true), b_tx).unwrap();
        let offer_a = match kinds(&mut a_rx).pop() {
            Some(PeerEventKind::Signal(p)) => p,
            other => panic!("expected offer, got {other:?}"),
        };
        let offer_b = match kinds(&mut b_rx).pop() {
            Some(PeerEventKind::Signal(p)) => p,
            other => panic!("expected offer, got {other:?}"),
        };

        // Lower id ignores the crossing offer
        a.signal(offer_b).unwrap();
        assert!(kinds(&mut a_rx).is_empty());

        // Higher id yields and answers
        b.signal(offer_a).unwrap();
        let answer = match kinds(&mut b_rx).pop() {
            Some(PeerEventKind::Signal(p)) => p,
            other => panic!("expected answer, got {other:?}"),
        };
        assert_eq!(answer.as_value()["type"], "answer");

        a.signal(answer).unwrap();
        assert_eq!(kinds(&mut a_rx), vec![PeerEventKind::Connected]);
        assert_eq!(kinds(&mut b_rx), vec![PeerEventKind::Connected]);
        b.send(Bytes::from_static(b"hi")).unwrap();
        assert_eq!(kinds(&mut a_rx), vec![PeerEventKind::Data(Bytes::from_static(b"hi"))]);
    }

    #[test]
    fn streams_surface_on_connect() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = sender("b", 0);
        let (b_tx, mut b_rx) = sender("a", 0);

        let mut a_opts = options("b", true);
        a_opts.local_stream = Some(MediaStream::new("cam-a"));
        let mut a = net.transport("a").open(a_opts, a_tx).unwrap();
        let mut b = net.transport("b").open(options("a", false), b_tx).unwrap();

        let offer = SignalPayload::new(json!({ "type": "offer", "from": "a" }));
        b.signal(offer).unwrap();
        a.signal(SignalPayload::new(json!({ "type": "answer", "from": "b" }))).unwrap();

        let _ = kinds(&mut a_rx);
        let b_events = kinds(&mut b_rx);
        assert!(b_events.contains(&PeerEventKind::Stream(MediaStream::new("cam-a"))));
        a.close();
    }

    #[test]
    fn sever_fails_both_ends() {
        let net = MemoryNetwork::new();
        let (a_tx, mut a_rx) = sender("b", 0);
        let (b_tx, mut b_rx) = sender("a", 0);
        let _a = net.transport("a").open(options("b", true), a_tx).unwrap();
        let _b = net.transport("b").open(options("a", false), b_tx).unwrap();

        assert!(net.sever("a", "b"));
        assert!(kinds(&mut a_rx).contains(&PeerEventKind::Error("link severed".into())));
        assert!(kinds(&mut b_rx).contains(&PeerEventKind::Error("link severed".into())));
        assert!(!net.sever("a", "b"));
    }
}
