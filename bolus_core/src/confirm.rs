//! Two-step confirmation before a dose is written to the entry store.
//!
//! The above-maximum acknowledgment and the recording confirmation are
//! independent preconditions; both are checked on every call. Neither is
//! retried automatically, each needs a new explicit answer from the user.

use crate::store::EntryStore;
use crate::{DoseCalculationResult, EntrySource, InsulinEntry, InsulinType, PolicyConfig, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a recording attempt was refused
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The dose was capped and the user has not acknowledged it
    AckRequired,
    /// The user has not confirmed the recording step
    ConfirmationRequired,
    /// Glucose was below the hypoglycemia threshold; never recordable
    HypoBlocked,
    /// No finalized result is held
    NothingToRecord,
    /// The finalized dose is zero units; there is no injection to record
    ZeroDose,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::AckRequired => "ack_required",
            RejectReason::ConfirmationRequired => "confirmation_required",
            RejectReason::HypoBlocked => "hypo_blocked",
            RejectReason::NothingToRecord => "nothing_to_record",
            RejectReason::ZeroDose => "zero_dose",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of a recording attempt
#[derive(Clone, Debug, PartialEq)]
pub enum ConfirmOutcome {
    Recorded(InsulinEntry),
    Rejected(RejectReason),
}

/// Check the human gates and, if satisfied, append the dose as a rapid entry
///
/// The append is the only write performed anywhere in the dose pipeline.
/// Entries always carry a positive number of units, so a zero dose is
/// refused whatever the answers.
pub fn confirm_and_record(
    result: &DoseCalculationResult,
    ack: bool,
    confirm: bool,
    policy: &PolicyConfig,
    store: &mut dyn EntryStore,
    now: DateTime<Utc>,
) -> Result<ConfirmOutcome> {
    if !has_dose(result) {
        tracing::info!("Recording rejected: {}", RejectReason::ZeroDose);
        return Ok(ConfirmOutcome::Rejected(RejectReason::ZeroDose));
    }

    if policy.require_acknowledgement_above_max && result.is_above_max && !ack {
        tracing::info!("Recording rejected: {}", RejectReason::AckRequired);
        return Ok(ConfirmOutcome::Rejected(RejectReason::AckRequired));
    }

    if policy.require_two_step_confirm_for_recording && !confirm {
        tracing::info!("Recording rejected: {}", RejectReason::ConfirmationRequired);
        return Ok(ConfirmOutcome::Rejected(RejectReason::ConfirmationRequired));
    }

    let entry = InsulinEntry::new(
        now,
        result.final_dose,
        InsulinType::Rapid,
        EntrySource::Calculator,
    );
    let id = store.append_insulin_entry(&entry)?;
    tracing::info!("Recorded {} units as entry {}", entry.units, id);

    Ok(ConfirmOutcome::Recorded(entry))
}

/// Whether the result carries an injectable amount of insulin
pub fn has_dose(result: &DoseCalculationResult) -> bool {
    result.final_dose.is_finite() && result.final_dose > 0.0
}
