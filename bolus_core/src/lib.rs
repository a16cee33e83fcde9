#![forbid(unsafe_code)]

//! Core domain model and business logic for the bolus dose calculator.
//!
//! This crate provides:
//! - Domain types (insulin entries, dose requests, profiles, results)
//! - Safety policy and configuration
//! - Insulin-on-board engine and dose calculator
//! - Safety gate state machine and two-step confirmation
//! - Persistence (entry WAL, CSV archive, profiles)

pub mod types;
pub mod error;
pub mod policy;
pub mod config;
pub mod logging;
pub mod iob;
pub mod calculator;
pub mod gate;
pub mod confirm;
pub mod store;
pub mod csv_rollup;
pub mod profile;
pub mod engine;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use policy::{InputBounds, PolicyConfig, ProfileDefaults};
pub use config::Config;
pub use iob::compute_iob;
pub use calculator::calculate;
pub use gate::{GateState, SafetyGate};
pub use confirm::{confirm_and_record, has_dose, ConfirmOutcome, RejectReason};
pub use store::{EntryStore, InMemoryEntryStore, JsonlEntryStore};
pub use profile::{FileProfileStore, ProfileStore, StoredDosingProfile};
pub use engine::{classify_glucose, evaluate, DoseSnapshot};
