//! Collective field aggregation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::participant::ParticipantState;

/// Aggregated snapshot of every participant the local node knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectiveField {
    pub resonance: f64,
    pub polarity: f64,
    pub coherence: f64,
    pub node_count: usize,
    /// Reserved for region-bucketed coherence. Never populated.
    pub regional_coherence: BTreeMap<String, f64>,
    /// Currently identical to `coherence`.
    pub global_coherence: f64,
    pub participant_states: BTreeMap<String, ParticipantState>,
}

impl CollectiveField {
    /// The all-zero field of an empty mesh.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up one participant's contribution.
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantState> {
        self.participant_states.get(user_id)
    }
}

/// Recompute the collective field from a set of participant states.
///
/// Metrics are unweighted arithmetic means. `last_update` does not weight
/// or decay a contribution. An empty input yields [`CollectiveField::empty`].
pub fn aggregate<'a, I>(states: I) -> CollectiveField
where
    I: IntoIterator<Item = &'a ParticipantState>,
{
    let mut resonance = 0.0;
    let mut polarity = 0.0;
    let mut coherence = 0.0;
    let mut count = 0usize;
    let mut participant_states = BTreeMap::new();

    for state in states {
        count += 1;
        resonance += state.resonance;
        polarity += state.polarity;
        coherence += state.coherence;
        participant_states.insert(state.user_id.clone(), state.clone());
    }

    if count == 0 {
        return CollectiveField::empty();
    }

    let n = count as f64;
    let coherence = coherence / n;

    CollectiveField {
        resonance: resonance / n,
        polarity: polarity / n,
        coherence,
        node_count: count,
        regional_coherence: BTreeMap::new(),
        global_coherence: coherence,
        participant_states,
    }
}
