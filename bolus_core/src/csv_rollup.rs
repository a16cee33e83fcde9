//! CSV rollup functionality for archiving the insulin entry log.
//!
//! This module implements atomic WAL-to-CSV conversion with proper error handling
//! to prevent data loss. The archive stays part of the readable history, so
//! rolled-up doses keep counting toward insulin on board.

use crate::{EntrySource, Error, InsulinEntry, InsulinType, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use uuid::Uuid;

/// A row in the CSV archive
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    id: String,
    timestamp: String,
    units: f64,
    insulin_type: InsulinType,
    source: EntrySource,
}

impl From<&InsulinEntry> for CsvRow {
    fn from(entry: &InsulinEntry) -> Self {
        CsvRow {
            id: entry.id.to_string(),
            timestamp: entry.timestamp.to_rfc3339(),
            units: entry.units,
            insulin_type: entry.insulin_type,
            source: entry.source,
        }
    }
}

impl TryFrom<CsvRow> for InsulinEntry {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Store(format!("Invalid UUID '{}': {}", row.id, e)))?;

        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| Error::Store(format!("Invalid timestamp '{}': {}", row.timestamp, e)))?
            .with_timezone(&Utc);

        Ok(InsulinEntry {
            id,
            timestamp,
            units: row.units,
            insulin_type: row.insulin_type,
            source: row.source,
        })
    }
}

/// Read every entry from the CSV archive
///
/// A malformed row fails the whole read for the same reason a corrupted
/// WAL line does.
pub fn read_archived_entries(path: &Path) -> Result<Vec<InsulinEntry>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;

    let mut entries = Vec::new();
    for (row_num, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let entry = InsulinEntry::try_from(row).map_err(|e| match e {
            Error::Store(msg) => Error::Store(format!("archive row {}: {}", row_num + 1, msg)),
            other => other,
        })?;
        entries.push(entry);
    }

    tracing::debug!("Read {} entries from CSV archive", entries.len());
    Ok(entries)
}

/// Roll up WAL entries into CSV and archive the WAL atomically
///
/// This function:
/// 1. Reads all entries from the WAL
/// 2. Appends them to the CSV file (creates with headers if needed)
/// 3. Syncs the CSV to disk
/// 4. Renames the WAL to .processed
/// 5. Returns the number of entries processed
///
/// # Safety
/// - CSV is fsynced before WAL is renamed
/// - WAL is renamed (not deleted) to allow manual recovery if needed
pub fn entries_to_csv_and_archive(wal_path: &Path, csv_path: &Path) -> Result<usize> {
    let entries = crate::store::read_entries(wal_path)?;

    if entries.is_empty() {
        tracing::info!("No entries in WAL to roll up");
        return Ok(0);
    }

    // Ensure parent directory exists
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;

    // Only a fresh archive gets a header row
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for entry in &entries {
        writer.serialize(CsvRow::from(entry))?;
    }

    // Flush and sync to disk
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;

    tracing::info!("Wrote {} entries to CSV", entries.len());

    let processed_path = wal_path.with_extension("wal.processed");
    std::fs::rename(wal_path, &processed_path)?;

    tracing::info!("Archived WAL to {:?}", processed_path);

    Ok(entries.len())
}

/// Clean up old processed WAL files
///
/// This removes all .wal.processed files in the given directory.
pub fn cleanup_processed_wals(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().map_or(false, |ext| ext == "processed") {
            std::fs::remove_file(&path)?;
            tracing::debug!("Removed processed WAL: {:?}", path);
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed WAL files", count);
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntryStore, JsonlEntryStore};
    use chrono::{Duration, TimeZone};
    use std::fs::File;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn create_test_entry(units: f64, minutes_ago: i64) -> InsulinEntry {
        InsulinEntry::new(
            now() - Duration::minutes(minutes_ago),
            units,
            InsulinType::Rapid,
            EntrySource::Calculator,
        )
    }

    #[test]
    fn test_rollup_creates_csv_and_archives_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());
        for i in 0..3 {
            store
                .append_insulin_entry(&create_test_entry(1.0 + i as f64, 30))
                .unwrap();
        }

        let count = entries_to_csv_and_archive(store.wal_path(), store.csv_path()).unwrap();
        assert_eq!(count, 3);

        assert!(store.csv_path().exists());
        assert!(!store.wal_path().exists());
        assert!(store.wal_path().with_extension("wal.processed").exists());
    }

    #[test]
    fn test_archived_entries_still_listed_in_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());

        let first = create_test_entry(2.5, 90);
        store.append_insulin_entry(&first).unwrap();
        entries_to_csv_and_archive(store.wal_path(), store.csv_path()).unwrap();

        let second = create_test_entry(1.5, 10);
        store.append_insulin_entry(&second).unwrap();

        let entries = store
            .list_insulin_entries(now() - Duration::hours(4))
            .unwrap();
        assert_eq!(entries, vec![first, second]);
    }

    #[test]
    fn test_rollup_appends_without_duplicate_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());

        store.append_insulin_entry(&create_test_entry(1.0, 20)).unwrap();
        assert_eq!(
            entries_to_csv_and_archive(store.wal_path(), store.csv_path()).unwrap(),
            1
        );

        store.append_insulin_entry(&create_test_entry(2.0, 10)).unwrap();
        assert_eq!(
            entries_to_csv_and_archive(store.wal_path(), store.csv_path()).unwrap(),
            1
        );

        let archived = read_archived_entries(store.csv_path()).unwrap();
        assert_eq!(archived.len(), 2);
    }

    #[test]
    fn test_empty_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wal_path = temp_dir.path().join("empty.wal");
        let csv_path = temp_dir.path().join("entries.csv");

        File::create(&wal_path).unwrap();

        let count = entries_to_csv_and_archive(&wal_path, &csv_path).unwrap();
        assert_eq!(count, 0);
        assert!(!csv_path.exists());
    }

    #[test]
    fn test_malformed_archive_row_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let csv_path = temp_dir.path().join("entries.csv");
        std::fs::write(
            &csv_path,
            "id,timestamp,units,insulin_type,source\nnot-a-uuid,2024-05-01T10:00:00Z,2.0,rapid,manual\n",
        )
        .unwrap();

        let err = read_archived_entries(&csv_path).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn test_cleanup_processed_wals() {
        let temp_dir = tempfile::tempdir().unwrap();

        File::create(temp_dir.path().join("s1.wal.processed")).unwrap();
        File::create(temp_dir.path().join("s2.wal.processed")).unwrap();
        File::create(temp_dir.path().join("keep.wal")).unwrap();

        let count = cleanup_processed_wals(temp_dir.path()).unwrap();
        assert_eq!(count, 2);

        assert!(!temp_dir.path().join("s1.wal.processed").exists());
        assert!(temp_dir.path().join("keep.wal").exists());
    }
}
