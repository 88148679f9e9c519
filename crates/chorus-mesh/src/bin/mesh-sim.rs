//! Mesh simulation binary
//!
//! Runs a handful of Chorus receivers on an in-process network, meshes them
//! through a signal relay and publishes random metrics every tick.
//!
//! - `CHORUS_SIM_NODES`: number of nodes (default 4)
//! - `CHORUS_SIM_ROUNDS`: number of publish rounds (default 10)
//! - `CHORUS_SIM_TICK_MS`: delay between rounds (default 250)
//!
//! Receiver settings come from the usual `CHORUS_*` variables, with incoming
//! connections always auto-accepted.

use std::time::Duration;

use chorus_field::MetricsUpdate;
use chorus_mesh::{settle, CollectiveReceiver, IncomingPolicy, MemoryNetwork, ReceiverConfig, SignalRelay};
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{key}: cannot parse {raw:?}").into()),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_sim=info,chorus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let nodes: usize = env_or("CHORUS_SIM_NODES", 4)?;
    let rounds: u32 = env_or("CHORUS_SIM_ROUNDS", 10)?;
    let tick_ms: u64 = env_or("CHORUS_SIM_TICK_MS", 250)?;
    let config = ReceiverConfig::from_env()?.with_incoming(IncomingPolicy::AutoAccept);

    info!(nodes, rounds, max_peers = config.max_peers, "Starting mesh simulation");

    let net = MemoryNetwork::new();
    let relay = SignalRelay::new();
    let mut receivers = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let id = format!("node-{i}");
        let mut receiver = CollectiveReceiver::with_config(id.clone(), config.clone(), net.transport(id))?;
        relay.attach(&mut receiver);
        receivers.push(receiver);
    }

    // Lower index initiates; the other side auto-accepts the offer
    for i in 0..nodes {
        for j in (i + 1)..nodes {
            let peer_id = format!("node-{j}");
            if let Err(e) = receivers[i].connect(&peer_id, true) {
                warn!(from = %receivers[i].self_id(), to = %peer_id, error = %e, "Connect failed");
            }
        }
    }
    let handled = settle(&mut receivers, &relay);
    debug!(handled, "Mesh settled");
    for receiver in &receivers {
        info!(node = %receiver.self_id(), connected = receiver.connected_count(), "Node meshed");
    }

    let mut rng = rand::thread_rng();
    let mut interval = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));

    for round in 1..=rounds {
        interval.tick().await;

        for receiver in receivers.iter_mut() {
            let update = MetricsUpdate::new()
                .resonance(rng.gen_range(0.0..=1.0))
                .polarity(rng.gen_range(-1.0..=1.0))
                .coherence(rng.gen_range(0.0..=1.0));
            receiver.update_self_state(update)?;
        }
        settle(&mut receivers, &relay);

        for receiver in receivers.iter_mut() {
            let evicted = receiver.prune_stale();
            if !evicted.is_empty() {
                info!(node = %receiver.self_id(), ?evicted, "Pruned silent peers");
            }
        }

        for receiver in &receivers {
            let field = receiver.field();
            info!(
                round,
                node = %receiver.self_id(),
                node_count = field.node_count,
                resonance = field.resonance,
                polarity = field.polarity,
                coherence = field.coherence,
                "Collective field"
            );
        }
    }

    for receiver in receivers.iter_mut() {
        receiver.disconnect();
    }
    info!("Mesh simulation finished");

    Ok(())
}
