//! End-to-end evaluation of a dose request.
//!
//! A [`DoseSnapshot`] reads the profile and the relevant slice of insulin
//! history exactly once, so every step of one calculation sees the same data
//! even if the store is appended to meanwhile.

use crate::iob::{compute_iob, iob_window_start};
use crate::profile::ProfileStore;
use crate::store::EntryStore;
use crate::{
    DoseRequest, GlucoseBand, InsulinEntry, PolicyConfig, Result, SafetyGate, UserDosingProfile,
};
use chrono::{DateTime, Utc};

/// Immutable inputs for one calculation
#[derive(Clone, Debug)]
pub struct DoseSnapshot {
    pub now: DateTime<Utc>,
    pub profile: UserDosingProfile,
    pub entries: Vec<InsulinEntry>,
}

impl DoseSnapshot {
    /// Read the user's profile and active-window entries
    ///
    /// Store failures and a missing profile propagate; only absent profile
    /// fields are defaulted.
    pub fn load(
        store: &dyn EntryStore,
        profiles: &dyn ProfileStore,
        user_id: &str,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let profile = profiles
            .get_dosing_profile(user_id)?
            .resolve_checked(policy)?;
        let entries =
            store.list_insulin_entries(iob_window_start(now, profile.active_insulin_hours))?;

        tracing::debug!(
            "Snapshot for {}: {} entries in the last {}h",
            user_id,
            entries.len(),
            profile.active_insulin_hours
        );

        Ok(Self {
            now,
            profile,
            entries,
        })
    }

    pub fn iob(&self) -> f64 {
        compute_iob(self.now, &self.entries, self.profile.active_insulin_hours)
    }
}

/// Run a request through a fresh safety gate
///
/// Validation errors are returned as `Err`; hypoglycemia and above-maximum
/// outcomes are gate states.
pub fn evaluate<'a>(
    snapshot: &DoseSnapshot,
    request: &DoseRequest,
    policy: &'a PolicyConfig,
) -> Result<SafetyGate<'a>> {
    let mut gate = SafetyGate::new(policy);
    gate.submit(request, &snapshot.profile, snapshot.iob())?;
    Ok(gate)
}

/// Place a glucose reading relative to the hypo threshold, target range
/// and hyper threshold
pub fn classify_glucose(glucose: f64, profile: &UserDosingProfile, policy: &PolicyConfig) -> GlucoseBand {
    if glucose < policy.hypo_threshold {
        GlucoseBand::Low
    } else if glucose > policy.hyper_threshold {
        GlucoseBand::High
    } else if glucose > profile.target_high {
        GlucoseBand::AboveTarget
    } else {
        GlucoseBand::InRange
    }
}
