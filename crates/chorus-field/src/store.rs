//! Latest-known participant state table.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::field::{aggregate, CollectiveField};
use crate::participant::ParticipantState;

/// Result of offering a state to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First state seen for this participant.
    Inserted,
    /// Replaced an existing state.
    Replaced,
    /// Older than the stored state; ignored.
    Stale,
    /// Carries a NaN or infinite value; ignored.
    Invalid,
}

impl UpdateOutcome {
    /// Whether the store changed.
    pub fn applied(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

/// Keyed table of participant states with its aggregate kept alongside.
///
/// Every mutation recomputes the [`CollectiveField`] before returning, so the
/// table and the field can never be observed out of step.
#[derive(Debug, Default)]
pub struct ParticipantStateStore {
    states: HashMap<String, ParticipantState>,
    field: CollectiveField,
}

impl ParticipantStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with one state.
    pub fn with_participant(state: ParticipantState) -> Self {
        let mut store = Self::new();
        store.apply(state);
        store
    }

    /// Offer a full state for its participant.
    ///
    /// States with a lower `seq` than the stored one are rejected as stale.
    /// An equal `seq` replaces, which keeps unsequenced senders working.
    /// States with a non-finite value are rejected so the field stays finite.
    pub fn apply(&mut self, state: ParticipantState) -> UpdateOutcome {
        if let Some(metric) = state.non_finite_metric() {
            debug!(user_id = %state.user_id, metric, "Ignoring participant state with non-finite value");
            return UpdateOutcome::Invalid;
        }

        let outcome = match self.states.get(&state.user_id) {
            Some(existing) if state.seq < existing.seq => {
                debug!(
                    user_id = %state.user_id,
                    incoming_seq = state.seq,
                    stored_seq = existing.seq,
                    "Ignoring stale participant state"
                );
                return UpdateOutcome::Stale;
            }
            Some(_) => UpdateOutcome::Replaced,
            None => UpdateOutcome::Inserted,
        };

        trace!(user_id = %state.user_id, seq = state.seq, ?outcome, "Storing participant state");
        self.states.insert(state.user_id.clone(), state);
        self.recompute();
        outcome
    }

    /// Remove one participant.
    pub fn remove(&mut self, user_id: &str) -> Option<ParticipantState> {
        let removed = self.states.remove(user_id);
        if removed.is_some() {
            self.recompute();
        }
        removed
    }

    /// Remove every participant.
    pub fn clear(&mut self) {
        self.states.clear();
        self.recompute();
    }

    pub fn get(&self, user_id: &str) -> Option<&ParticipantState> {
        self.states.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.states.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// All stored states, in no particular order.
    pub fn states(&self) -> impl Iterator<Item = &ParticipantState> {
        self.states.values()
    }

    /// The aggregate of the current table.
    pub fn field(&self) -> &CollectiveField {
        &self.field
    }

    fn recompute(&mut self) {
        self.field = aggregate(self.states.values());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str, coherence: f64, seq: u64) -> ParticipantState {
        ParticipantState::new(id)
            .with_metrics(0.0, 0.0, coherence)
            .with_seq(seq)
    }

    #[test]
    fn empty_store_has_zero_field() {
        let store = ParticipantStateStore::new();
        assert!(store.is_empty());
        assert_eq!(store.field().node_count, 0);
        assert_eq!(store.field().coherence, 0.0);
    }

    #[test]
    fn apply_recomputes_immediately() {
        let mut store = ParticipantStateStore::with_participant(state("self", 0.0, 0));
        assert_eq!(store.field().node_count, 1);

        assert_eq!(store.apply(state("p1", 1.0, 1)), UpdateOutcome::Inserted);
        assert_eq!(store.field().node_count, 2);
        assert!((store.field().coherence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn replace_is_full_not_merged() {
        let mut store = ParticipantStateStore::new();
        let mut first = state("p1", 0.4, 1);
        first.lat = Some(10.0);
        store.apply(first);

        let second = state("p1", 0.8, 2);
        assert_eq!(store.apply(second), UpdateOutcome::Replaced);

        let stored = store.get("p1").unwrap();
        assert_eq!(stored.coherence, 0.8);
        assert!(stored.lat.is_none());
    }

    #[test]
    fn older_sequence_is_ignored() {
        let mut store = ParticipantStateStore::new();
        store.apply(state("p1", 0.9, 5));

        let outcome = store.apply(state("p1", 0.1, 4));
        assert_eq!(outcome, UpdateOutcome::Stale);
        assert!(!outcome.applied());
        assert_eq!(store.get("p1").unwrap().coherence, 0.9);
        assert!((store.field().coherence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn equal_sequence_replaces() {
        let mut store = ParticipantStateStore::new();
        store.apply(state("p1", 0.2, 0));
        assert_eq!(store.apply(state("p1", 0.6, 0)), UpdateOutcome::Replaced);
        assert_eq!(store.get("p1").unwrap().coherence, 0.6);
    }

    #[test]
    fn remove_and_clear_recompute() {
        let mut store = ParticipantStateStore::new();
        store.apply(state("a", 1.0, 0));
        store.apply(state("b", 0.0, 0));

        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(store.field().node_count, 1);
        assert_eq!(store.field().coherence, 0.0);

        store.clear();
        assert_eq!(store.field().node_count, 0);
        assert!(store.field().participant_states.is_empty());
    }

    #[test]
    fn non_finite_state_is_refused() {
        let mut store = ParticipantStateStore::new();
        store.apply(state("p1", 0.4, 1));

        let outcome = store.apply(state("p1", f64::NAN, 2));
        assert_eq!(outcome, UpdateOutcome::Invalid);
        assert!(!outcome.applied());
        assert_eq!(store.get("p1").unwrap().seq, 1);
        assert!((store.field().coherence - 0.4).abs() < 1e-9);

        let mut located = state("p2", 0.1, 0);
        located.lat = Some(f64::INFINITY);
        assert_eq!(store.apply(located), UpdateOutcome::Invalid);
        assert!(!store.contains("p2"));
    }
}
