//! Chorus Mesh - serverless collective field over peer links
//!
//! Each node runs a [`CollectiveReceiver`]. It keeps direct links to the
//! other participants, broadcasts its own metrics on every change and folds
//! what it hears into a shared [`CollectiveField`](chorus_field::CollectiveField).
//! There is no server of record: every node computes the field locally and
//! converges once updates have propagated.
//!
//! # Architecture
//!
//! - **Transport**: pluggable peer links (`Transport` / `TransportPeer`)
//! - **PeerConnectionManager**: link lifecycle and the `max_peers` cap
//! - **Wire**: JSON `{type, payload}` envelopes
//! - **Receiver**: the owner of links and participant table
//! - **Memory**: in-process network and signal relay for tests and simulation
//!
//! # Example
//!
//! ```no_run
//! use chorus_field::MetricsUpdate;
//! use chorus_mesh::{settle, CollectiveReceiver, MemoryNetwork, SignalRelay};
//!
//! let net = MemoryNetwork::new();
//! let relay = SignalRelay::new();
//! let mut a = CollectiveReceiver::new("a", net.transport("a"));
//! let mut b = CollectiveReceiver::new("b", net.transport("b"));
//! relay.attach(&mut a);
//! relay.attach(&mut b);
//!
//! a.connect("b", true).unwrap();
//! b.connect("a", false).unwrap();
//! let mut nodes = [a, b];
//! settle(&mut nodes, &relay);
//!
//! nodes[0].update_self_state(MetricsUpdate::new().coherence(0.8)).unwrap();
//! settle(&mut nodes, &relay);
//! assert_eq!(nodes[1].field().node_count, 2);
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod peer_manager;
pub mod receiver;
pub mod transport;
pub mod wire;

pub use config::{IncomingPolicy, ReceiverConfig};
pub use error::{Error, Result};
pub use memory::{settle, MemoryNetwork, MemoryTransport, RelayedSignal, SignalRelay};
pub use peer_manager::{LinkState, PeerConnectionManager, SignalRoute, Transition};
pub use receiver::CollectiveReceiver;
pub use transport::{
    LinkId, MediaStream, PeerEvent, PeerEventKind, PeerEventSender, PeerOptions, SignalPayload,
    Transport, TransportPeer,
};
pub use wire::{Inbound, MeshMessage};
