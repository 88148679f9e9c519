//! Per-participant metric state.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in unix milliseconds.
///
/// Clocks before the epoch collapse to 0 rather than failing.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The latest reported metric tuple for one participant in the mesh.
///
/// States are always stored whole. A newer state replaces the previous one
/// entirely; there is no field-level merge between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    pub user_id: String,
    pub display_name: String,
    pub resonance: f64,
    pub polarity: f64,
    pub coherence: f64,
    /// Unix millis of the last local or remote update.
    pub last_update: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Monotonic per-participant sequence number.
    ///
    /// Senders that predate sequencing omit it and read back as 0.
    #[serde(default)]
    pub seq: u64,
}

impl ParticipantState {
    /// A zero-valued state for `user_id`, stamped now.
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            resonance: 0.0,
            polarity: 0.0,
            coherence: 0.0,
            last_update: now_millis(),
            lat: None,
            lon: None,
            seq: 0,
        }
    }

    /// Set the three metrics at once.
    #[must_use]
    pub fn with_metrics(mut self, resonance: f64, polarity: f64, coherence: f64) -> Self {
        self.resonance = resonance;
        self.polarity = polarity;
        self.coherence = coherence;
        self
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Name of the first metric that is NaN or infinite, if any.
    ///
    /// Such values cannot be represented on the wire.
    pub fn non_finite_metric(&self) -> Option<&'static str> {
        non_finite(&[
            ("resonance", Some(self.resonance)),
            ("polarity", Some(self.polarity)),
            ("coherence", Some(self.coherence)),
            ("lat", self.lat),
            ("lon", self.lon),
        ])
    }

    /// Overwrite the fields present in `update`, leaving the rest untouched.
    ///
    /// Only used for the local participant. Remote states always arrive whole.
    pub fn apply_update(&mut self, update: &MetricsUpdate) {
        if let Some(ref name) = update.display_name {
            self.display_name = name.clone();
        }
        if let Some(v) = update.resonance {
            self.resonance = v;
        }
        if let Some(v) = update.polarity {
            self.polarity = v;
        }
        if let Some(v) = update.coherence {
            self.coherence = v;
        }
        if update.lat.is_some() {
            self.lat = update.lat;
        }
        if update.lon.is_some() {
            self.lon = update.lon;
        }
    }
}

/// A partial change to the local participant's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resonance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coherence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

impl MetricsUpdate {
    /// An empty update.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn resonance(mut self, v: f64) -> Self {
        self.resonance = Some(v);
        self
    }

    #[must_use]
    pub fn polarity(mut self, v: f64) -> Self {
        self.polarity = Some(v);
        self
    }

    #[must_use]
    pub fn coherence(mut self, v: f64) -> Self {
        self.coherence = Some(v);
        self
    }

    /// Name of the first provided value that is NaN or infinite, if any.
    pub fn non_finite_metric(&self) -> Option<&'static str> {
        non_finite(&[
            ("resonance", self.resonance),
            ("polarity", self.polarity),
            ("coherence", self.coherence),
            ("lat", self.lat),
            ("lon", self.lon),
        ])
    }

    /// Set the optional location pair.
    #[must_use]
    pub fn location(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }
}

fn non_finite(values: &[(&'static str, Option<f64>)]) -> Option<&'static str> {
    values
        .iter()
        .find(|(_, v)| v.is_some_and(|v| !v.is_finite()))
        .map(|(name, _)| *name)
}
