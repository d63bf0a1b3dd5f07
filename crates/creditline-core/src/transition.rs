//! Outcome of checking a requested status change.

use serde::{Deserialize, Serialize};

/// What a backend should do with a requested status change.
///
/// Every backend consults the entity's own check (for example
/// [`PaymentOrder::settle_check`](crate::PaymentOrder::settle_check)) while it
/// holds the entity row locked, then applies the effects only on `Apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// The change is valid and has not happened yet.
    Apply,
    /// The entity is already in the requested state, or in a state that
    /// subsumes it. Acknowledge without side effects.
    AlreadyApplied,
    /// The entity is in a terminal state the change may not leave.
    Rejected,
}

impl Transition {
    /// Whether effects should be applied.
    #[must_use]
    pub const fn is_apply(self) -> bool {
        matches!(self, Self::Apply)
    }
}
