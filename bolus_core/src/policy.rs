//! Safety policy constants.
//!
//! A [`PolicyConfig`] is loaded once at startup (see [`crate::Config`]) and
//! passed by reference into every calculation. It is the single source of
//! truth for safety-relevant numbers, including the defaults applied to
//! missing dosing-profile fields.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Immutable safety constants for dose calculation and gating
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Glucose below this blocks any dose suggestion
    #[serde(default = "default_hypo_threshold")]
    pub hypo_threshold: f64,

    #[serde(default = "default_hyper_threshold")]
    pub hyper_threshold: f64,

    /// Dose granularity in units of insulin
    #[serde(default = "default_rounding_increment")]
    pub rounding_increment: f64,

    #[serde(default)]
    pub min_bolus: f64,

    /// Insulin action duration used when a profile does not set one
    #[serde(default = "default_active_insulin_hours")]
    pub default_active_insulin_hours: f64,

    /// Factor applied to the correction term while glucose is falling (0 suppresses it)
    #[serde(default)]
    pub trend_down_correction_multiplier: f64,

    #[serde(default = "default_true")]
    pub block_when_below_hypo: bool,

    #[serde(default = "default_true")]
    pub require_acknowledgement_above_max: bool,

    #[serde(default = "default_true")]
    pub require_two_step_confirm_for_recording: bool,

    /// Fast-acting carbohydrate recommended by the hypoglycemia advisory
    #[serde(default = "default_hypo_fast_carbs_grams")]
    pub hypo_fast_carbs_grams: f64,

    /// Minutes until glucose should be rechecked after a hypoglycemia advisory
    #[serde(default = "default_hypo_recheck_minutes")]
    pub hypo_recheck_minutes: u32,

    #[serde(default)]
    pub profile_defaults: ProfileDefaults,

    #[serde(default)]
    pub bounds: InputBounds,
}

/// Values substituted for absent dosing-profile fields
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileDefaults {
    #[serde(default = "default_icr")]
    pub icr: f64,

    #[serde(default = "default_isf")]
    pub isf: f64,

    #[serde(default = "default_target_low")]
    pub target_low: f64,

    #[serde(default = "default_target_high")]
    pub target_high: f64,

    #[serde(default = "default_max_bolus")]
    pub max_bolus: f64,
}

/// Accepted ranges for dose request inputs
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InputBounds {
    #[serde(default = "default_glucose_min")]
    pub glucose_min: f64,

    #[serde(default = "default_glucose_max")]
    pub glucose_max: f64,

    #[serde(default)]
    pub carbs_min: f64,

    #[serde(default = "default_carbs_max")]
    pub carbs_max: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hypo_threshold: default_hypo_threshold(),
            hyper_threshold: default_hyper_threshold(),
            rounding_increment: default_rounding_increment(),
            min_bolus: 0.0,
            default_active_insulin_hours: default_active_insulin_hours(),
            trend_down_correction_multiplier: 0.0,
            block_when_below_hypo: true,
            require_acknowledgement_above_max: true,
            require_two_step_confirm_for_recording: true,
            hypo_fast_carbs_grams: default_hypo_fast_carbs_grams(),
            hypo_recheck_minutes: default_hypo_recheck_minutes(),
            profile_defaults: ProfileDefaults::default(),
            bounds: InputBounds::default(),
        }
    }
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            icr: default_icr(),
            isf: default_isf(),
            target_low: default_target_low(),
            target_high: default_target_high(),
            max_bolus: default_max_bolus(),
        }
    }
}

impl Default for InputBounds {
    fn default() -> Self {
        Self {
            glucose_min: default_glucose_min(),
            glucose_max: default_glucose_max(),
            carbs_min: 0.0,
            carbs_max: default_carbs_max(),
        }
    }
}

// Default value functions
fn default_hypo_threshold() -> f64 {
    70.0
}

fn default_hyper_threshold() -> f64 {
    250.0
}

fn default_rounding_increment() -> f64 {
    0.5
}

fn default_active_insulin_hours() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

fn default_hypo_fast_carbs_grams() -> f64 {
    15.0
}

fn default_hypo_recheck_minutes() -> u32 {
    15
}

fn default_icr() -> f64 {
    10.0
}

fn default_isf() -> f64 {
    30.0
}

fn default_target_low() -> f64 {
    70.0
}

fn default_target_high() -> f64 {
    140.0
}

fn default_max_bolus() -> f64 {
    15.0
}

fn default_glucose_min() -> f64 {
    20.0
}

fn default_glucose_max() -> f64 {
    600.0
}

fn default_carbs_max() -> f64 {
    500.0
}

impl PolicyConfig {
    /// Check internal consistency of the policy
    ///
    /// Returns a list of problems; an empty list means the policy is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let finite = [
            ("hypo_threshold", self.hypo_threshold),
            ("hyper_threshold", self.hyper_threshold),
            ("rounding_increment", self.rounding_increment),
            ("min_bolus", self.min_bolus),
            ("default_active_insulin_hours", self.default_active_insulin_hours),
            (
                "trend_down_correction_multiplier",
                self.trend_down_correction_multiplier,
            ),
            ("hypo_fast_carbs_grams", self.hypo_fast_carbs_grams),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                problems.push(format!("{} must be a finite number", name));
            }
        }

        if self.rounding_increment <= 0.0 {
            problems.push("rounding_increment must be greater than 0".into());
        }
        if self.min_bolus < 0.0 {
            problems.push("min_bolus must not be negative".into());
        }
        if self.default_active_insulin_hours <= 0.0 {
            problems.push("default_active_insulin_hours must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.trend_down_correction_multiplier) {
            problems.push("trend_down_correction_multiplier must be between 0 and 1".into());
        }
        if self.hypo_threshold >= self.hyper_threshold {
            problems.push("hypo_threshold must be below hyper_threshold".into());
        }
        if self.bounds.glucose_min >= self.bounds.glucose_max {
            problems.push("bounds.glucose_min must be below bounds.glucose_max".into());
        }
        if self.bounds.carbs_min < 0.0 || self.bounds.carbs_min >= self.bounds.carbs_max {
            problems.push("bounds.carbs_min must be in [0, bounds.carbs_max)".into());
        }

        let defaults = &self.profile_defaults;
        let positive = [
            ("icr", defaults.icr),
            ("isf", defaults.isf),
            ("target_low", defaults.target_low),
            ("target_high", defaults.target_high),
            ("max_bolus", defaults.max_bolus),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                problems.push(format!("profile_defaults.{} must be greater than 0", name));
            }
        }
        if defaults.target_low > defaults.target_high {
            problems.push("profile_defaults.target_low must not exceed target_high".into());
        }
        if defaults.max_bolus < self.min_bolus {
            problems.push("profile_defaults.max_bolus must not be below min_bolus".into());
        }

        problems
    }

    /// Validate the policy, failing with every problem found
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}
