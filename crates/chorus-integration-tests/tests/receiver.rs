//! End-to-end behavior of a single receiver against a hand-driven transport.

use chorus_field::MetricsUpdate;
use chorus_integration_tests::{connect, mean, report, Harness};
use chorus_mesh::{CollectiveReceiver, Error, LinkState, MeshMessage, ReceiverConfig};
use proptest::prelude::*;

#[test]
fn new_receiver_holds_only_itself() {
    let rx = CollectiveReceiver::new("u1", Harness::default());
    assert_eq!(rx.field().node_count, 1);
    assert_eq!(rx.field().coherence, 0.0);
    assert_eq!(rx.field().resonance, 0.0);
    assert_eq!(rx.field().polarity, 0.0);
}

#[test]
fn connected_peer_counts_only_after_reporting() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());

    rx.connect("p1", true).unwrap();
    assert_eq!(rx.peer_state("p1"), Some(LinkState::Signaling));
    assert!(!rx.is_connected("p1"));

    harness.peer("p1").connected();
    rx.pump();
    assert!(rx.is_connected("p1"));
    assert_eq!(rx.field().node_count, 1);
}

#[test]
fn thirty_two_peers_average_exactly() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());

    let coherence: Vec<f64> = (0..32).map(|i| ((i * 37) % 101) as f64 / 100.0).collect();
    for (i, c) in coherence.iter().enumerate() {
        let id = format!("peer-{i}");
        connect(&mut rx, &harness, &id);
        report(&harness, &id, (0.0, 0.0, *c), 1);
    }
    rx.pump();

    // Self contributes a zero
    let mut all = coherence.clone();
    all.push(0.0);
    assert_eq!(rx.field().node_count, 33);
    assert!((rx.field().coherence - mean(&all)).abs() < 1e-9);
}

#[test]
fn disconnect_then_reconnect_starts_clean() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    connect(&mut rx, &harness, "p1");
    report(&harness, "p1", (0.5, 0.5, 0.5), 1);
    rx.pump();
    rx.update_self_state(MetricsUpdate::new().coherence(0.9)).unwrap();
    assert_eq!(rx.field().node_count, 2);

    rx.disconnect();
    assert_eq!(rx.field().node_count, 0);
    assert_eq!(rx.live_count(), 0);
    assert!(harness.closed().contains(&"p1".to_string()));

    rx.connect("p1", true).unwrap();
    harness.peer("p1").connected();
    rx.pump();
    assert!(rx.is_connected("p1"));
    assert_eq!(rx.field().node_count, 1);
    assert_eq!(rx.field().coherence, 0.0);
}

#[test]
fn connect_past_capacity_is_refused() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    for i in 0..32 {
        rx.connect(&format!("peer-{i}"), true).unwrap();
    }

    let err = rx.connect("peer-32", true).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { live: 32, max: 32 }));
    assert_eq!(rx.live_count(), 32);
    assert_eq!(harness.opened(), 32);
    assert_eq!(rx.peer_state("peer-32"), None);
}

#[test]
fn capacity_frees_up_after_a_peer_closes() {
    let harness = Harness::default();
    let config = ReceiverConfig::default().with_max_peers(2);
    let mut rx = CollectiveReceiver::with_config("u1", config, harness.clone()).unwrap();
    connect(&mut rx, &harness, "p1");
    connect(&mut rx, &harness, "p2");
    assert!(rx.connect("p3", true).is_err());

    harness.peer("p1").closed();
    rx.pump();
    rx.connect("p3", true).unwrap();
    assert_eq!(rx.live_count(), 2);
}

#[test]
fn disconnect_without_connections_is_harmless() {
    let mut rx = CollectiveReceiver::new("u1", Harness::default());
    rx.disconnect();
    rx.disconnect();
    assert_eq!(rx.field().node_count, 0);
}

#[test]
fn broadcast_to_nobody_sends_nothing() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    let state = rx.participant("u1").cloned().unwrap();

    assert_eq!(rx.broadcast(&MeshMessage::StateUpdate(state)).unwrap(), 0);
    assert_eq!(rx.update_self_state(MetricsUpdate::new().polarity(-0.4)).unwrap(), 0);

    // Signaling links are not sent to either
    rx.connect("p1", true).unwrap();
    assert_eq!(rx.update_self_state(MetricsUpdate::new().polarity(0.4)).unwrap(), 0);
    assert!(harness.states_sent_to("p1").is_empty());
}

#[test]
fn self_update_survives_the_wire() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    connect(&mut rx, &harness, "p1");

    rx.update_self_state(
        MetricsUpdate::new()
            .display_name("Ursula")
            .resonance(0.25)
            .polarity(-0.5)
            .coherence(0.75)
            .location(48.1, 11.6),
    )
    .unwrap();

    let sent = harness.states_sent_to("p1");
    let decoded = sent.last().unwrap();
    assert_eq!(decoded, rx.participant("u1").unwrap());

    // A second receiver applying those bytes stores the same state
    let other_harness = Harness::default();
    let mut other = CollectiveReceiver::new("p1", other_harness.clone());
    connect(&mut other, &other_harness, "u1");
    let bytes = chorus_mesh::wire::encode(&MeshMessage::StateUpdate(decoded.clone())).unwrap();
    other.receive("u1", &bytes).unwrap();
    assert_eq!(other.participant("u1"), Some(decoded));
}

#[test]
fn non_finite_update_is_refused_before_sending() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    connect(&mut rx, &harness, "p1");
    let sent_before = harness.states_sent_to("p1").len();

    let result = rx.update_self_state(MetricsUpdate::new().coherence(f64::NAN));
    assert!(matches!(result, Err(Error::InvalidMetric("coherence"))));
    assert_eq!(harness.states_sent_to("p1").len(), sent_before);
    assert_eq!(rx.field().coherence, 0.0);

    // Every state that does go out decodes back to what is stored locally
    rx.update_self_state(MetricsUpdate::new().coherence(0.6).polarity(-0.1)).unwrap();
    let sent = harness.states_sent_to("p1");
    assert_eq!(sent.last(), rx.participant("u1"));
}

#[test]
fn bytes_from_unlinked_peers_are_refused() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    let bytes = chorus_mesh::wire::encode(&MeshMessage::StateUpdate(
        chorus_field::ParticipantState::new("ghost").with_metrics(1.0, 1.0, 1.0),
    ))
    .unwrap();

    assert!(matches!(rx.receive("ghost", &bytes), Err(Error::UnknownPeer(_))));
    assert_eq!(rx.field().node_count, 1);
    assert!(rx.participant("ghost").is_none());
}

#[test]
fn errored_peer_leaves_the_field() {
    let harness = Harness::default();
    let mut rx = CollectiveReceiver::new("u1", harness.clone());
    connect(&mut rx, &harness, "p1");
    connect(&mut rx, &harness, "p2");
    report(&harness, "p1", (1.0, 1.0, 1.0), 1);
    report(&harness, "p2", (0.5, 0.5, 0.5), 1);
    rx.pump();
    assert_eq!(rx.field().node_count, 3);

    harness.peer("p1").error("dtls failure");
    rx.pump();
    assert_eq!(rx.field().node_count, 2);
    assert!((rx.field().coherence - 0.25).abs() < 1e-9);
    assert!(rx.is_connected("p2"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn field_is_mean_of_all_reports(
        metrics in prop::collection::vec((0.0f64..=1.0, -1.0f64..=1.0, 0.0f64..=1.0), 0..=32)
    ) {
        let harness = Harness::default();
        let mut rx = CollectiveReceiver::new("u1", harness.clone());
        for (i, m) in metrics.iter().enumerate() {
            let id = format!("peer-{i}");
            connect(&mut rx, &harness, &id);
            report(&harness, &id, *m, 1);
        }
        rx.pump();

        let field = rx.field();
        prop_assert_eq!(field.node_count, metrics.len() + 1);

        let with_self = |pick: fn(&(f64, f64, f64)) -> f64| {
            let mut values: Vec<f64> = metrics.iter().map(pick).collect();
            values.push(0.0);
            mean(&values)
        };
        prop_assert!((field.resonance - with_self(|m| m.0)).abs() < 1e-9);
        prop_assert!((field.polarity - with_self(|m| m.1)).abs() < 1e-9);
        prop_assert!((field.coherence - with_self(|m| m.2)).abs() < 1e-9);
    }
}
