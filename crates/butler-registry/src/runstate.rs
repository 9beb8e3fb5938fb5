//! Run status state machine.
//!
//! The transition table is the single authority on which status edges are
//! legal; the store consults it inside every mutating transaction. Terminal
//! statuses are immutable — a callback landing on a terminal run is rejected
//! here and answered idempotently at the HTTP layer.

use crate::error::{RegistryError, Result};
use crate::types::RunStatus;

/// True when `from -> to` is a legal edge.
///
/// ```text
/// pending   -> queued | cancelled | skipped | failed
/// queued    -> running | cancelled
/// running   -> planned | succeeded | failed | cancelled | timed_out
/// planned   -> confirmed | discarded | cancelled
/// confirmed -> applying | cancelled
/// applying  -> succeeded | failed | timed_out
/// ```
///
/// The `pending -> failed` edge is the upstream-output resolution fault: a
/// cohort run that can never receive its inputs fails before it is queued.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    match from {
        Pending => matches!(to, Queued | Cancelled | Skipped | Failed),
        Queued => matches!(to, Running | Cancelled),
        Running => matches!(to, Planned | Succeeded | Failed | Cancelled | TimedOut),
        Planned => matches!(to, Confirmed | Discarded | Cancelled),
        Confirmed => matches!(to, Applying | Cancelled),
        Applying => matches!(to, Succeeded | Failed | TimedOut),
        // Terminal statuses accept nothing.
        Succeeded | Failed | Cancelled | TimedOut | Discarded | Skipped => false,
    }
}

/// Validate a transition, producing `IllegalTransition` on a bad edge.
pub fn check_transition(from: RunStatus, to: RunStatus) -> Result<()> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(RegistryError::IllegalTransition { from, to })
    }
}
