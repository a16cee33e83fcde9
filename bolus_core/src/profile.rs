//! Dosing profile persistence and default resolution.
//!
//! Profiles are stored as one JSON file per user. Stored fields may be
//! absent; [`StoredDosingProfile::resolve`] fills them from the policy
//! ([`crate::ProfileDefaults`] and `default_active_insulin_hours`). A missing
//! or unreadable profile file is an error, never a silent fallback to
//! defaults.

use crate::{Error, PolicyConfig, Result, UserDosingProfile};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Read access to dosing profiles
pub trait ProfileStore {
    fn get_dosing_profile(&self, user_id: &str) -> Result<StoredDosingProfile>;
}

/// Dosing profile as stored, with every field optional
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct StoredDosingProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isf: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bolus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_insulin_hours: Option<f64>,
}

impl StoredDosingProfile {
    /// Fill absent fields from the defaults
    ///
    /// Zero, negative and non-finite values count as absent.
    pub fn resolve(&self, policy: &PolicyConfig) -> UserDosingProfile {
        let defaults = &policy.profile_defaults;
        UserDosingProfile {
            icr: field_or_default("icr", self.icr, defaults.icr),
            isf: field_or_default("isf", self.isf, defaults.isf),
            target_low: field_or_default("target_low", self.target_low, defaults.target_low),
            target_high: field_or_default("target_high", self.target_high, defaults.target_high),
            max_bolus: field_or_default("max_bolus", self.max_bolus, defaults.max_bolus),
            active_insulin_hours: field_or_default(
                "active_insulin_hours",
                self.active_insulin_hours,
                policy.default_active_insulin_hours,
            ),
        }
    }

    /// Resolve against the policy and check the resulting shape
    pub fn resolve_checked(&self, policy: &PolicyConfig) -> Result<UserDosingProfile> {
        let profile = self.resolve(policy);

        if profile.target_low > profile.target_high {
            return Err(Error::Profile(format!(
                "target_low {} is above target_high {}",
                profile.target_low, profile.target_high
            )));
        }
        if profile.max_bolus < policy.min_bolus {
            return Err(Error::Profile(format!(
                "max_bolus {} is below the policy minimum {}",
                profile.max_bolus, policy.min_bolus
            )));
        }

        Ok(profile)
    }

    /// Overlay the fields set in `other`
    pub fn merged_with(&self, other: &StoredDosingProfile) -> Self {
        Self {
            icr: other.icr.or(self.icr),
            isf: other.isf.or(self.isf),
            target_low: other.target_low.or(self.target_low),
            target_high: other.target_high.or(self.target_high),
            max_bolus: other.max_bolus.or(self.max_bolus),
            active_insulin_hours: other.active_insulin_hours.or(self.active_insulin_hours),
        }
    }
}

fn field_or_default(name: &str, value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        Some(v) => {
            tracing::warn!("Profile field {} has unusable value {}, using default {}", name, v, default);
            default
        }
        None => default,
    }
}

/// File-backed profile store, one JSON document per user
pub struct FileProfileStore {
    dir: PathBuf,
}

impl FileProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Standard layout under a data directory
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("profiles"))
    }

    /// Path of a user's profile file
    pub fn path_for(&self, user_id: &str) -> Result<PathBuf> {
        let valid = !user_id.is_empty()
            && user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Profile(format!("invalid user id '{}'", user_id)));
        }
        Ok(self.dir.join(format!("{}.json", user_id)))
    }

    /// Save a profile with exclusive locking
    ///
    /// Atomically writes the profile by:
    /// 1. Writing to a temp file
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    pub fn save(&self, user_id: &str, profile: &StoredDosingProfile) -> Result<()> {
        let path = self.path_for(user_id)?;
        std::fs::create_dir_all(&self.dir)?;

        let temp = NamedTempFile::new_in(&self.dir)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string_pretty(profile)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved profile for {} to {:?}", user_id, path);
        Ok(())
    }

    /// Load, modify and save a profile; a missing profile starts empty
    ///
    /// Nothing is written if `f` fails.
    pub fn update<F>(&self, user_id: &str, f: F) -> Result<StoredDosingProfile>
    where
        F: FnOnce(&mut StoredDosingProfile) -> Result<()>,
    {
        let mut profile = match self.get_dosing_profile(user_id) {
            Ok(p) => p,
            Err(Error::ProfileNotFound(_)) => StoredDosingProfile::default(),
            Err(e) => return Err(e),
        };
        f(&mut profile)?;
        self.save(user_id, &profile)?;
        Ok(profile)
    }
}

impl ProfileStore for FileProfileStore {
    fn get_dosing_profile(&self, user_id: &str) -> Result<StoredDosingProfile> {
        let path = self.path_for(user_id)?;
        if !path.exists() {
            return Err(Error::ProfileNotFound(user_id.to_string()));
        }

        let file = File::open(&path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        file.unlock()?;
        read?;

        let profile = serde_json::from_str::<StoredDosingProfile>(&contents)?;
        tracing::debug!("Loaded profile for {} from {:?}", user_id, path);
        Ok(profile)
    }
}
