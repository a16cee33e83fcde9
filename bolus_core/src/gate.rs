//! Safety gate state machine.
//!
//! ```text
//! Idle -> Validating -> HypoBlocked
//!                    -> Calculated -> AboveMaxPendingAck -> Finalized
//!                                  -> Finalized
//! ```
//!
//! Validation failures return the gate to `Idle`. `HypoBlocked` is terminal
//! for the request: no dose is produced and nothing can be recorded from it,
//! whatever acknowledgment or confirmation the caller supplies.

use crate::confirm::{confirm_and_record, has_dose, ConfirmOutcome, RejectReason};
use crate::store::EntryStore;
use crate::{
    calculate, DoseCalculationResult, DoseRequest, Error, HypoAdvisory, PolicyConfig, Result,
    UserDosingProfile,
};
use chrono::{DateTime, Utc};

/// Current position of a request in the gate
#[derive(Clone, Debug, PartialEq)]
pub enum GateState {
    Idle,
    Validating,
    HypoBlocked(HypoAdvisory),
    Calculated(DoseCalculationResult),
    AboveMaxPendingAck(DoseCalculationResult),
    Finalized(DoseCalculationResult),
}

impl GateState {
    /// The dose breakdown, if this state carries one
    pub fn result(&self) -> Option<&DoseCalculationResult> {
        match self {
            GateState::Calculated(r) | GateState::AboveMaxPendingAck(r) | GateState::Finalized(r) => {
                Some(r)
            }
            GateState::Idle | GateState::Validating | GateState::HypoBlocked(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GateState::Idle => "idle",
            GateState::Validating => "validating",
            GateState::HypoBlocked(_) => "hypo_blocked",
            GateState::Calculated(_) => "calculated",
            GateState::AboveMaxPendingAck(_) => "above_max_pending_ack",
            GateState::Finalized(_) => "finalized",
        }
    }
}

/// Range-check a dose request against the policy bounds
pub fn validate_request(request: &DoseRequest, policy: &PolicyConfig) -> Result<()> {
    let bounds = &policy.bounds;
    check_range("glucose", request.glucose, bounds.glucose_min, bounds.glucose_max)?;
    check_range("carbs", request.carbs, bounds.carbs_min, bounds.carbs_max)?;
    Ok(())
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::validation(field, "must be a number"));
    }
    if value < min || value > max {
        return Err(Error::validation(
            field,
            format!("{} is outside [{}, {}]", value, min, max),
        ));
    }
    Ok(())
}

/// Drives one dose request through validation, hypoglycemia blocking,
/// calculation and maximum-dose capping
#[derive(Debug)]
pub struct SafetyGate<'a> {
    policy: &'a PolicyConfig,
    state: GateState,
}

impl<'a> SafetyGate<'a> {
    pub fn new(policy: &'a PolicyConfig) -> Self {
        Self {
            policy,
            state: GateState::Idle,
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn policy(&self) -> &PolicyConfig {
        self.policy
    }

    /// Evaluate a request
    ///
    /// The hypoglycemia check runs before any dose math. A validation error
    /// leaves the gate in `Idle`.
    pub fn submit(
        &mut self,
        request: &DoseRequest,
        profile: &UserDosingProfile,
        iob: f64,
    ) -> Result<&GateState> {
        if !matches!(self.state, GateState::Idle) {
            return Err(Error::Other(format!(
                "gate already holds a request (state: {})",
                self.state.name()
            )));
        }

        self.state = GateState::Validating;
        if let Err(e) = validate_request(request, self.policy) {
            tracing::info!("Dose request rejected by validation: {}", e);
            self.state = GateState::Idle;
            return Err(e);
        }

        if self.policy.block_when_below_hypo && request.glucose < self.policy.hypo_threshold {
            let advisory = HypoAdvisory {
                glucose: request.glucose,
                threshold: self.policy.hypo_threshold,
                fast_carbs_grams: self.policy.hypo_fast_carbs_grams,
                recheck_minutes: self.policy.hypo_recheck_minutes,
            };
            tracing::warn!(
                "Glucose {} below hypo threshold {}, dose blocked",
                request.glucose,
                self.policy.hypo_threshold
            );
            self.state = GateState::HypoBlocked(advisory);
            return Ok(&self.state);
        }

        let calculated = calculate(request, profile, iob, self.policy);
        self.state = GateState::Calculated(calculated.clone());

        let capped = calculated.capped_at(profile.max_bolus);
        if capped.is_above_max {
            tracing::warn!(
                "Suggested dose {} exceeds max bolus {}, capped",
                capped.raw_suggested_dose,
                profile.max_bolus
            );
        }

        self.state = if capped.is_above_max && self.policy.require_acknowledgement_above_max {
            GateState::AboveMaxPendingAck(capped)
        } else {
            GateState::Finalized(capped)
        };
        tracing::info!("Gate state: {}", self.state.name());

        Ok(&self.state)
    }

    /// Supply the above-maximum acknowledgment
    ///
    /// Only moves `AboveMaxPendingAck` to `Finalized` when `ack` is true;
    /// every other state is left as is.
    pub fn acknowledge(&mut self, ack: bool) -> &GateState {
        if ack {
            if let GateState::AboveMaxPendingAck(result) = &self.state {
                let result = result.clone();
                tracing::info!("Above-max dose acknowledged");
                self.state = GateState::Finalized(result);
            }
        }
        &self.state
    }

    /// Whether the held result could be recorded with the given answers
    pub fn is_recordable(&self, ack: bool, confirm: bool) -> bool {
        match &self.state {
            GateState::AboveMaxPendingAck(r) => {
                has_dose(r) && ack && self.confirm_satisfied(confirm)
            }
            GateState::Finalized(r) => has_dose(r) && self.confirm_satisfied(confirm),
            _ => false,
        }
    }

    fn confirm_satisfied(&self, confirm: bool) -> bool {
        confirm || !self.policy.require_two_step_confirm_for_recording
    }

    /// Run the confirmation flow on the held result
    ///
    /// Rejections keep the held result so the caller can re-invoke after the
    /// user acts; a supplied acknowledgment is kept even when confirmation is
    /// still missing. A successful recording resets the gate to `Idle`.
    pub fn record(
        &mut self,
        ack: bool,
        confirm: bool,
        store: &mut dyn EntryStore,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        // A Finalized above-max result has already been acknowledged
        let (result, acknowledged) = match &self.state {
            GateState::HypoBlocked(_) => {
                tracing::warn!("Recording refused: glucose below hypo threshold");
                return Ok(ConfirmOutcome::Rejected(RejectReason::HypoBlocked));
            }
            GateState::AboveMaxPendingAck(r) => (r.clone(), ack),
            GateState::Finalized(r) => (r.clone(), true),
            GateState::Idle | GateState::Validating | GateState::Calculated(_) => {
                return Ok(ConfirmOutcome::Rejected(RejectReason::NothingToRecord));
            }
        };

        self.acknowledge(acknowledged);

        let outcome = confirm_and_record(&result, acknowledged, confirm, self.policy, store, now)?;
        if matches!(outcome, ConfirmOutcome::Recorded(_)) {
            self.state = GateState::Idle;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEntryStore;
    use crate::GlucoseTrend;
    use chrono::TimeZone;

    fn profile() -> UserDosingProfile {
        UserDosingProfile {
            icr: 10.0,
            isf: 30.0,
            target_low: 70.0,
            target_high: 140.0,
            max_bolus: 15.0,
            active_insulin_hours: 4.0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn request(glucose: f64, carbs: f64) -> DoseRequest {
        DoseRequest::new(glucose, carbs, GlucoseTrend::Stable)
    }

    #[test]
    fn test_in_range_request_finalizes() {
        crate::logging::init_test();
        let policy = PolicyConfig::default();
        let mut gate = SafetyGate::new(&policy);

        let state = gate.submit(&request(180.0, 60.0), &profile(), 0.0).unwrap();

        match state {
            GateState::Finalized(r) => {
                assert_eq!(r.meal_bolus, 6.0);
                assert_eq!(r.correction_bolus, 2.5);
                assert_eq!(r.final_dose, 8.5);
                assert!(!r.is_above_max);
            }
            other => panic!("expected Finalized, got {:?}", other),
        }
    }

    #[test]
    fn test_hypo_blocks_before_calculation() {
        let policy = PolicyConfig::default();
        let mut gate = SafetyGate::new(&policy);

        let state = gate.submit(&request(65.0, 60.0), &profile(), 0.0).unwrap();

        match state {
            GateState::HypoBlocked(advisory) => {
                assert_eq!(advisory.glucose, 65.0);
                assert_eq!(advisory.threshold, 70.0);
                assert_eq!(advisory.fast_carbs_grams, 15.0);
                assert_eq!(advisory.recheck_minutes, 15);
            }
            other => panic!("expected HypoBlocked, got {:?}", other),
        }
        assert!(gate.state().result().is_none());
    }

    #[test]
    fn test_hypo_block_can_be_disabled() {
        let policy = PolicyConfig {
            block_when_below_hypo: false,
            ..PolicyConfig::default()
        };
        let mut gate = SafetyGate::new(&policy);

        let state = gate.submit(&request(65.0, 30.0), &profile(), 0.0).unwrap();

        assert!(matches!(state, GateState::Finalized(_)));
    }

    #[test]
    fn test_glucose_at_threshold_is_not_blocked() {
        let policy = PolicyConfig::default();
        let mut gate = SafetyGate::new(&policy);

        let state = gate.submit(&request(70.0, 30.0), &profile(), 0.0).unwrap();

        assert!(matches!(state, GateState::Finalized(_)));
    }

    #[test]
    fn test_above_max_waits_for_ack() {
        let policy = PolicyConfig::default();
        let mut gate = SafetyGate::new(&policy);

        // 180 g / 10 = 18 units against a 15 unit ceiling
        let state = gate.submit(&request(105.0, 180.0), &profile(), 0.0).unwrap();
        match state {
            GateState::AboveMaxPendingAck(r) => {
                assert_eq!(r.raw_suggested_dose, 18.0);
                assert_eq!(r.final_dose, 15.0);
                assert!(r.is_above_max);
            }
            other => panic!("expected AboveMaxPendingAck, got {:?}", other),
        }

        assert!(matches!(gate.acknowledge(false), GateState::AboveMaxPendingAck(_)));
        assert!(matches!(gate.acknowledge(true), GateState::Finalized(_)));
    }

    #[test]
    fn test_above_max_without_ack_requirement_finalizes_capped() {
        let policy = PolicyConfig {
            require_acknowledgement_above_max: false,
            ..PolicyConfig::default()
        };
        let mut gate = SafetyGate::new(&policy);

        let state = gate.submit(&request(105.0, 180.0), &profile(), 0.0).unwrap();

        match state {
            GateState::Finalized(r) => {
                assert_eq!(r.final_dose, 15.0);
                assert!(r.is_above_max);
            }
            other => panic!("expected Finalized, got {:?}", other),
        }
    }

    #[test]
    fn test_final_dose_never_exceeds_max() {
        let policy = PolicyConfig::default();
        for carbs in (0..=500).step_by(25) {
            for glucose in (70..=600).step_by(53) {
                let mut gate = SafetyGate::new(&policy);
                let state = gate
                    .submit(&request(glucose as f64, carbs as f64), &profile(), 0.0)
                    .unwrap();
                let result = state.result().unwrap();
                assert!(result.final_dose <= profile().max_bolus);
                assert!(result.final_dose >= policy.min_bolus);
            }
        }
    }

    #[test]
    fn test_final_dose_respects_off_grid_min_bolus() {
        let policy = PolicyConfig {
            min_bolus: 0.2,
            ..PolicyConfig::default()
        };
        for iob in [0.0, 0.4, 1.0, 3.0, 12.0] {
            for carbs in (0..=200).step_by(5) {
                for glucose in (70..=400).step_by(37) {
                    let mut gate = SafetyGate::new(&policy);
                    let state = gate
                        .submit(&request(glucose as f64, carbs as f64), &profile(), iob)
                        .unwrap();
                    let result = state.result().unwrap();
                    assert!(
                        result.final_dose >= policy.min_bolus,
                        "glucose {} carbs {} iob {} -> {}",
                        glucose,
                        carbs,
                        iob,
                        result.final_dose
                    );
                    assert!(result.final_dose <= profile().max_bolus);
                }
            }
        }
    }

    #[test]
    fn test_zero_dose_is_not_recordable() {
        let policy = PolicyConfig::default();
        let mut store = InMemoryEntryStore::default();
        let mut gate = SafetyGate::new(&policy);

        // Insulin on board covers the whole correction
        let state = gate.submit(&request(100.0, 0.0), &profile(), 5.0).unwrap();
        assert!(matches!(state, GateState::Finalized(r) if r.final_dose == 0.0));

        assert!(!gate.is_recordable(true, true));
        let outcome = gate.record(true, true, &mut store, now()).unwrap();

        assert_eq!(outcome, ConfirmOutcome::Rejected(RejectReason::ZeroDose));
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_validation_failure_returns_to_idle() {
        let policy = PolicyConfig::default();
        let mut gate = SafetyGate::new(&policy);

        let err = gate.submit(&request(19.0, 10.0), &profile(), 0.0).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "glucose"));
        assert_eq!(gate.state(), &GateState::Idle);

        let err = gate.submit(&request(120.0, 501.0), &profile(), 0.0).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "carbs"));

        let err = gate.submit(&request(f64::NAN, 10.0), &profile(), 0.0).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(gate.state(), &GateState::Idle);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let policy = PolicyConfig::default();
        assert!(validate_request(&request(20.0, 0.0), &policy).is_ok());
        assert!(validate_request(&request(600.0, 500.0), &policy).is_ok());
        assert!(validate_request(&request(120.0, -1.0), &policy).is_err());
    }

    #[test]
    fn test_submit_twice_is_refused() {
        let policy = PolicyConfig::default();
        let mut gate = SafetyGate::new(&policy);
        gate.submit(&request(120.0, 30.0), &profile(), 0.0).unwrap();

        assert!(gate.submit(&request(120.0, 30.0), &profile(), 0.0).is_err());
    }

    #[test]
    fn test_hypo_block_dominates_every_answer() {
        let policy = PolicyConfig::default();
        for ack in [false, true] {
            for confirm in [false, true] {
                let mut store = InMemoryEntryStore::default();
                let mut gate = SafetyGate::new(&policy);
                gate.submit(&request(55.0, 80.0), &profile(), 0.0).unwrap();

                assert!(!gate.is_recordable(ack, confirm));
                let outcome = gate.record(ack, confirm, &mut store, now()).unwrap();

                assert_eq!(outcome, ConfirmOutcome::Rejected(RejectReason::HypoBlocked));
                assert!(store.entries().is_empty());
            }
        }
    }

    #[test]
    fn test_record_above_max_requires_ack_then_confirm() {
        let policy = PolicyConfig::default();
        let mut store = InMemoryEntryStore::default();
        let mut gate = SafetyGate::new(&policy);
        gate.submit(&request(105.0, 180.0), &profile(), 0.0).unwrap();

        let outcome = gate.record(false, true, &mut store, now()).unwrap();
        assert_eq!(outcome, ConfirmOutcome::Rejected(RejectReason::AckRequired));
        assert!(matches!(gate.state(), GateState::AboveMaxPendingAck(_)));

        let outcome = gate.record(true, false, &mut store, now()).unwrap();
        assert_eq!(
            outcome,
            ConfirmOutcome::Rejected(RejectReason::ConfirmationRequired)
        );
        assert!(store.entries().is_empty());

        let outcome = gate.record(true, true, &mut store, now()).unwrap();
        match outcome {
            ConfirmOutcome::Recorded(entry) => assert_eq!(entry.units, 15.0),
            other => panic!("expected Recorded, got {:?}", other),
        }
        assert_eq!(store.entries().len(), 1);
        assert_eq!(gate.state(), &GateState::Idle);
    }

    #[test]
    fn test_record_from_idle_has_nothing() {
        let policy = PolicyConfig::default();
        let mut store = InMemoryEntryStore::default();
        let mut gate = SafetyGate::new(&policy);

        let outcome = gate.record(true, true, &mut store, now()).unwrap();

        assert_eq!(outcome, ConfirmOutcome::Rejected(RejectReason::NothingToRecord));
    }
}
