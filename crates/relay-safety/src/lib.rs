//! relay-safety: risk classification of incoming commands and the
//! per-user confirmation ledger that gates risky ones.
//!
//! [`SafetyGate`] is a pure classifier: it never stores anything.  The
//! caller keeps the outstanding confirmations in a [`ConfirmationStore`]
//! and feeds the user's next reply back through
//! [`SafetyGate::is_confirmation_valid`] / [`SafetyGate::is_cancellation`].

pub mod confirm;
pub mod error;
pub mod gate;
pub mod patterns;

pub use confirm::{ConfirmationStore, Lookup, PendingConfirmation};
pub use error::{Result, SafetyError};
pub use gate::{RiskAssessment, RiskTier, SafetyGate};
