//! Chorus Integration Tests
//!
//! Cross-crate tests for the Chorus mesh live under `tests/`. This library
//! holds what they share: a hand-driven [`Harness`] transport and helpers to
//! connect peers and feed them states.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chorus_field::ParticipantState;
use chorus_mesh::wire;
use chorus_mesh::{
    CollectiveReceiver, MeshMessage, PeerEventSender, PeerOptions, Result, SignalPayload,
    Transport, TransportPeer,
};

/// Transport driven by hand: tests fire peer events through the saved
/// senders and read back whatever the receiver sent.
#[derive(Clone, Default)]
pub struct Harness {
    opened: Arc<Mutex<Vec<PeerEventSender>>>,
    outbox: Arc<Mutex<Vec<(String, Bytes)>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

struct HarnessPeer {
    peer_id: String,
    outbox: Arc<Mutex<Vec<(String, Bytes)>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl TransportPeer for HarnessPeer {
    fn signal(&mut self, _payload: SignalPayload) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        self.outbox.lock().unwrap().push((self.peer_id.clone(), data));
        Ok(())
    }

    fn close(&mut self) {
        self.closed.lock().unwrap().push(self.peer_id.clone());
    }
}

impl Transport for Harness {
    fn open(&self, options: PeerOptions, events: PeerEventSender) -> Result<Box<dyn TransportPeer>> {
        self.opened.lock().unwrap().push(events);
        Ok(Box::new(HarnessPeer {
            peer_id: options.peer_id,
            outbox: Arc::clone(&self.outbox),
            closed: Arc::clone(&self.closed),
        }))
    }
}

impl Harness {
    /// Event sender of the most recent link to `peer_id`.
    pub fn peer(&self, peer_id: &str) -> PeerEventSender {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.peer_id() == peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no link opened to {peer_id}"))
    }

    /// How many transport peers were ever opened.
    pub fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    /// Everything sent to `peer_id`, decoded.
    pub fn states_sent_to(&self, peer_id: &str) -> Vec<ParticipantState> {
        self.outbox
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == peer_id)
            .map(|(_, bytes)| match wire::decode(bytes).unwrap() {
                chorus_mesh::Inbound::Message(MeshMessage::StateUpdate(s)) => s,
                other => panic!("unexpected outbound message {other:?}"),
            })
            .collect()
    }
}

/// Open a link to `peer_id` and fire its `Connected` event.
pub fn connect(rx: &mut CollectiveReceiver, harness: &Harness, peer_id: &str) {
    rx.connect(peer_id, true).unwrap();
    harness.peer(peer_id).connected();
    rx.pump();
}

/// Have `peer_id` report a full state with the given metrics.
pub fn report(harness: &Harness, peer_id: &str, metrics: (f64, f64, f64), seq: u64) {
    let state = ParticipantState::new(peer_id)
        .with_metrics(metrics.0, metrics.1, metrics.2)
        .with_seq(seq);
    let bytes = wire::encode(&MeshMessage::StateUpdate(state)).unwrap();
    harness.peer(peer_id).data(bytes);
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
