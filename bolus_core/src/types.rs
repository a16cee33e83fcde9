//! Core domain types for the bolus calculator.
//!
//! This module defines the fundamental types used throughout the system:
//! - Insulin history entries
//! - Dose requests and glucose trend
//! - Resolved dosing profiles
//! - Calculation results and hypoglycemia advisories

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Insulin History
// ============================================================================

/// Identifier assigned to an insulin entry when it is appended to a store
pub type EntryId = Uuid;

/// Kind of insulin administered
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InsulinType {
    Rapid,
    Basal,
}

/// Where an insulin entry came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Recorded through the confirmation flow of the calculator
    Calculator,
    /// Logged directly by the user
    #[default]
    Manual,
}

/// A recorded insulin dose
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InsulinEntry {
    pub id: EntryId,
    pub timestamp: DateTime<Utc>,
    pub units: f64,
    pub insulin_type: InsulinType,
    #[serde(default)]
    pub source: EntrySource,
}

impl InsulinEntry {
    /// Create a new entry with a fresh identifier
    pub fn new(
        timestamp: DateTime<Utc>,
        units: f64,
        insulin_type: InsulinType,
        source: EntrySource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            units,
            insulin_type,
            source,
        }
    }

    pub fn is_rapid(&self) -> bool {
        self.insulin_type == InsulinType::Rapid
    }
}

// ============================================================================
// Dose Requests
// ============================================================================

/// Direction glucose is currently moving
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseTrend {
    Rising,
    #[default]
    Stable,
    Falling,
}

/// Raw user input for one calculation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseRequest {
    pub glucose: f64,
    pub carbs: f64,
    #[serde(default)]
    pub trend: GlucoseTrend,
}

impl DoseRequest {
    pub fn new(glucose: f64, carbs: f64, trend: GlucoseTrend) -> Self {
        Self {
            glucose,
            carbs,
            trend,
        }
    }
}

// ============================================================================
// Profile
// ============================================================================

/// Personal dosing parameters with every field resolved
///
/// See [`crate::profile::StoredDosingProfile`] for the stored shape where
/// fields may be absent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserDosingProfile {
    /// Grams of carbohydrate covered by one unit
    pub icr: f64,
    /// Glucose drop per unit
    pub isf: f64,
    pub target_low: f64,
    pub target_high: f64,
    /// Personal ceiling for a single bolus
    pub max_bolus: f64,
    pub active_insulin_hours: f64,
}

impl UserDosingProfile {
    /// Midpoint of the target range, used as the correction target
    pub fn target_mid(&self) -> f64 {
        (self.target_low + self.target_high) / 2.0
    }
}

// ============================================================================
// Results
// ============================================================================

/// Breakdown of one dose calculation
///
/// Created fresh per calculation and never mutated; capping produces a new
/// value through [`DoseCalculationResult::capped_at`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseCalculationResult {
    pub meal_bolus: f64,
    pub correction_bolus: f64,
    pub iob: f64,
    /// Rounded suggestion before the maximum-dose cap
    pub raw_suggested_dose: f64,
    pub final_dose: f64,
    pub is_above_max: bool,
}

impl DoseCalculationResult {
    /// Apply a maximum-dose ceiling
    pub fn capped_at(&self, max_bolus: f64) -> Self {
        if self.raw_suggested_dose > max_bolus {
            Self {
                final_dose: max_bolus,
                is_above_max: true,
                ..self.clone()
            }
        } else {
            Self {
                final_dose: self.raw_suggested_dose,
                is_above_max: false,
                ..self.clone()
            }
        }
    }
}

/// Immediate-action guidance returned instead of a dose when glucose is low
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HypoAdvisory {
    pub glucose: f64,
    pub threshold: f64,
    pub fast_carbs_grams: f64,
    pub recheck_minutes: u32,
}

impl HypoAdvisory {
    pub fn message(&self) -> String {
        format!(
            "Glucose {} is below {}. Do not take insulin. Eat {} g of fast-acting carbohydrate and recheck in {} minutes.",
            self.glucose, self.threshold, self.fast_carbs_grams, self.recheck_minutes
        )
    }
}

/// Where a glucose reading sits relative to the profile and policy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseBand {
    Low,
    InRange,
    AboveTarget,
    High,
}

// ============================================================================
// Parsing
// ============================================================================

impl FromStr for GlucoseTrend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rising" | "up" => Ok(GlucoseTrend::Rising),
            "stable" | "flat" => Ok(GlucoseTrend::Stable),
            "falling" | "down" => Ok(GlucoseTrend::Falling),
            other => Err(format!(
                "unknown trend '{}' (expected rising, stable or falling)",
                other
            )),
        }
    }
}

impl FromStr for InsulinType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rapid" | "bolus" => Ok(InsulinType::Rapid),
            "basal" => Ok(InsulinType::Basal),
            other => Err(format!(
                "unknown insulin type '{}' (expected rapid or basal)",
                other
            )),
        }
    }
}

impl fmt::Display for InsulinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsulinType::Rapid => write!(f, "rapid"),
            InsulinType::Basal => write!(f, "basal"),
        }
    }
}

impl fmt::Display for GlucoseTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlucoseTrend::Rising => write!(f, "rising"),
            GlucoseTrend::Stable => write!(f, "stable"),
            GlucoseTrend::Falling => write!(f, "falling"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_raw(raw: f64) -> DoseCalculationResult {
        DoseCalculationResult {
            meal_bolus: raw,
            correction_bolus: 0.0,
            iob: 0.0,
            raw_suggested_dose: raw,
            final_dose: raw,
            is_above_max: false,
        }
    }

    #[test]
    fn test_capped_at_limits_final_dose() {
        let capped = result_with_raw(18.0).capped_at(15.0);
        assert_eq!(capped.final_dose, 15.0);
        assert_eq!(capped.raw_suggested_dose, 18.0);
        assert!(capped.is_above_max);
    }

    #[test]
    fn test_capped_at_equal_to_max_is_not_above() {
        let capped = result_with_raw(15.0).capped_at(15.0);
        assert_eq!(capped.final_dose, 15.0);
        assert!(!capped.is_above_max);
    }

    #[test]
    fn test_target_mid() {
        let profile = UserDosingProfile {
            icr: 10.0,
            isf: 30.0,
            target_low: 70.0,
            target_high: 140.0,
            max_bolus: 15.0,
            active_insulin_hours: 4.0,
        };
        assert_eq!(profile.target_mid(), 105.0);
    }

    #[test]
    fn test_parse_trend_and_type() {
        assert_eq!("Falling".parse::<GlucoseTrend>(), Ok(GlucoseTrend::Falling));
        assert_eq!("basal".parse::<InsulinType>(), Ok(InsulinType::Basal));
        assert!("sideways".parse::<GlucoseTrend>().is_err());
    }

    #[test]
    fn test_entry_serializes_snake_case() {
        let entry = InsulinEntry::new(Utc::now(), 4.5, InsulinType::Rapid, EntrySource::Calculator);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"insulin_type\":\"rapid\""));
        assert!(json.contains("\"source\":\"calculator\""));
    }
}
