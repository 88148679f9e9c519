//! Chorus Field - participant state and the collective field
//!
//! Every node in a Chorus mesh keeps the latest reported metrics of each
//! participant it knows about, itself included, and folds them into one
//! [`CollectiveField`] snapshot.
//!
//! # Model
//!
//! - **ParticipantState**: one full metric tuple per user id, replaced whole
//! - **ParticipantStateStore**: the keyed table, which recomputes its field on
//!   every mutation
//! - **aggregate**: pure function from states to field (unweighted means)
//!
//! # Ordering
//!
//! States carry a per-participant `seq`. A state with a lower `seq` than the
//! stored one is dropped, so a delayed duplicate cannot roll a view back.

mod field;
mod participant;
mod store;

pub use field::{aggregate, CollectiveField};
pub use participant::{now_millis, MetricsUpdate, ParticipantState};
pub use store::{ParticipantStateStore, UpdateOutcome};
