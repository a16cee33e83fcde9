//! Bolus dose calculation.
//!
//! Combines a meal term and a glucose correction term, subtracts insulin on
//! board, clamps to the policy floor and rounds to the dose increment:
//!
//! ```text
//! meal        = carbs / icr
//! correction  = max(0, (glucose - target_mid) / isf)   (scaled while falling)
//! raw         = max(min_bolus, meal + correction - iob) rounded half-up
//! ```
//!
//! A floor that is not on the rounding grid is lifted to the next grid step,
//! so the rounded dose never falls below `min_bolus`.
//!
//! The maximum-dose cap is deliberately not applied here; see [`crate::gate`].

use crate::{DoseCalculationResult, DoseRequest, GlucoseTrend, PolicyConfig, UserDosingProfile};

// Absorbs binary representation error (e.g. 0.25 / 0.1 = 2.4999...) before rounding
const ROUNDING_EPSILON: f64 = 1e-9;

/// Round half-up to a multiple of `increment`
pub fn round_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    let steps = (value / increment + 0.5 + ROUNDING_EPSILON).floor();
    clean(steps * increment)
}

/// Round up to a multiple of `increment`
pub fn ceil_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    let steps = (value / increment - ROUNDING_EPSILON).ceil();
    clean(steps * increment)
}

/// Round to the nearest 0.1
pub fn round_to_tenth(value: f64) -> f64 {
    round_to_increment(value, 0.1)
}

// Strip float noise such as 0.30000000000000004
fn clean(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Calculate a suggested bolus
///
/// Inputs must already be validated; this is a pure function and identical
/// arguments always produce an identical result.
pub fn calculate(
    request: &DoseRequest,
    profile: &UserDosingProfile,
    iob: f64,
    policy: &PolicyConfig,
) -> DoseCalculationResult {
    let meal_bolus = request.carbs / profile.icr;

    let mut correction_bolus = ((request.glucose - profile.target_mid()) / profile.isf).max(0.0);
    if request.trend == GlucoseTrend::Falling {
        correction_bolus *= policy.trend_down_correction_multiplier;
    }

    let unrounded = (meal_bolus + correction_bolus - iob).max(policy.min_bolus);
    let mut raw_suggested_dose = round_to_increment(unrounded, policy.rounding_increment);
    if raw_suggested_dose < policy.min_bolus {
        raw_suggested_dose = ceil_to_increment(policy.min_bolus, policy.rounding_increment);
    }

    tracing::debug!(
        "meal {:.2} + correction {:.2} - iob {:.1} = {:.2} -> {}",
        meal_bolus,
        correction_bolus,
        iob,
        unrounded,
        raw_suggested_dose
    );

    DoseCalculationResult {
        meal_bolus,
        correction_bolus,
        iob,
        raw_suggested_dose,
        final_dose: raw_suggested_dose,
        is_above_max: false,
    }
}
