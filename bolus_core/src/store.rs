//! Insulin entry store.
//!
//! Entries are appended to a JSONL (JSON Lines) log with file locking to
//! ensure safe concurrent access. Rolled-up entries live in a CSV archive
//! (see [`crate::csv_rollup`]); reads merge the archive and the log.

use crate::{EntryId, Error, InsulinEntry, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Read/append access to the insulin history
pub trait EntryStore {
    /// Entries with `timestamp >= since`, in insertion order
    fn list_insulin_entries(&self, since: DateTime<Utc>) -> Result<Vec<InsulinEntry>>;

    fn append_insulin_entry(&mut self, entry: &InsulinEntry) -> Result<EntryId>;
}

/// JSONL-based entry store with a CSV archive
pub struct JsonlEntryStore {
    wal_path: PathBuf,
    csv_path: PathBuf,
}

impl JsonlEntryStore {
    /// Create a store over the given log and archive paths
    pub fn new(wal_path: impl Into<PathBuf>, csv_path: impl Into<PathBuf>) -> Self {
        Self {
            wal_path: wal_path.into(),
            csv_path: csv_path.into(),
        }
    }

    /// Standard layout under a data directory
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(
            data_dir.join("wal").join("insulin_entries.wal"),
            data_dir.join("insulin_entries.csv"),
        )
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.wal_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl EntryStore for JsonlEntryStore {
    fn list_insulin_entries(&self, since: DateTime<Utc>) -> Result<Vec<InsulinEntry>> {
        let mut entries = Vec::new();
        let mut seen_ids = HashSet::new();

        // Archive first: everything in it was written before the current log
        if self.csv_path.exists() {
            let archived = crate::csv_rollup::read_archived_entries(&self.csv_path)?;
            for entry in archived {
                if entry.timestamp >= since && seen_ids.insert(entry.id) {
                    entries.push(entry);
                }
            }
        }

        let archived_count = entries.len();
        for entry in read_entries(&self.wal_path)? {
            if entry.timestamp >= since && seen_ids.insert(entry.id) {
                entries.push(entry);
            }
        }

        tracing::debug!(
            "Loaded {} entries since {} ({} archived)",
            entries.len(),
            since,
            archived_count
        );
        Ok(entries)
    }

    fn append_insulin_entry(&mut self, entry: &InsulinEntry) -> Result<EntryId> {
        self.ensure_parent_dir()?;

        // Open file for appending
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.wal_path)?;

        // Acquire exclusive lock
        file.lock_exclusive()?;

        // Write entry as JSON line
        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.sync_data()?;
        file.unlock()?;

        tracing::debug!("Appended entry {} to WAL", entry.id);
        Ok(entry.id)
    }
}

/// Read all entries from a WAL file
///
/// Unlike a best-effort log, an unparsable line is an error: a dose that
/// cannot be read would silently lower insulin on board.
pub fn read_entries(path: &Path) -> Result<Vec<InsulinEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    // Acquire shared lock for reading
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<InsulinEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                let _ = file.unlock();
                return Err(Error::Store(format!(
                    "corrupted entry at {}:{}: {}",
                    path.display(),
                    line_num + 1,
                    e
                )));
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} entries from WAL", entries.len());
    Ok(entries)
}

/// Vec-backed store for embedding and tests
#[derive(Clone, Debug, Default)]
pub struct InMemoryEntryStore {
    entries: Vec<InsulinEntry>,
}

impl InMemoryEntryStore {
    pub fn with_entries(entries: Vec<InsulinEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[InsulinEntry] {
        &self.entries
    }
}

impl EntryStore for InMemoryEntryStore {
    fn list_insulin_entries(&self, since: DateTime<Utc>) -> Result<Vec<InsulinEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect())
    }

    fn append_insulin_entry(&mut self, entry: &InsulinEntry) -> Result<EntryId> {
        self.entries.push(entry.clone());
        Ok(entry.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntrySource, InsulinType};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn create_test_entry(units: f64, hours_ago: i64) -> InsulinEntry {
        InsulinEntry::new(
            now() - Duration::hours(hours_ago),
            units,
            InsulinType::Rapid,
            EntrySource::Manual,
        )
    }

    #[test]
    fn test_append_and_read_single_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());

        let entry = create_test_entry(4.5, 1);
        let id = store.append_insulin_entry(&entry).unwrap();
        assert_eq!(id, entry.id);

        let entries = store
            .list_insulin_entries(now() - Duration::hours(24))
            .unwrap();
        assert_eq!(entries, vec![entry]);
    }

    #[test]
    fn test_values_are_returned_exactly() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());

        let mut entry = create_test_entry(3.35, 0);
        entry.timestamp = entry.timestamp + Duration::nanoseconds(123_456_789);
        store.append_insulin_entry(&entry).unwrap();

        let entries = store.list_insulin_entries(now() - Duration::hours(1)).unwrap();
        assert_eq!(entries[0].units, 3.35);
        assert_eq!(entries[0].timestamp, entry.timestamp);
    }

    #[test]
    fn test_preserves_insertion_order_and_filters_since() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());

        let recent = create_test_entry(2.0, 1);
        let old = create_test_entry(5.0, 30);
        let older_but_later = create_test_entry(1.0, 3);
        for e in [&recent, &old, &older_but_later] {
            store.append_insulin_entry(e).unwrap();
        }

        let entries = store.list_insulin_entries(now() - Duration::hours(4)).unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![recent.id, older_but_later.id]);
    }

    #[test]
    fn test_read_missing_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonlEntryStore::in_data_dir(temp_dir.path());

        let entries = store.list_insulin_entries(now()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_corrupted_line_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = JsonlEntryStore::in_data_dir(temp_dir.path());
        store.append_insulin_entry(&create_test_entry(2.0, 1)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.wal_path())
            .unwrap();
        writeln!(file, "{{\"units\": 4.0, truncated").unwrap();

        let err = store
            .list_insulin_entries(now() - Duration::hours(4))
            .unwrap_err();
        assert!(matches!(err, Error::Store(ref msg) if msg.contains(":2:")));
    }

    #[test]
    fn test_concurrent_appends() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data_dir = temp_dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let data_dir = data_dir.clone();
                std::thread::spawn(move || {
                    let mut store = JsonlEntryStore::in_data_dir(&data_dir);
                    for _ in 0..10 {
                        store
                            .append_insulin_entry(&create_test_entry(i as f64 + 0.5, 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = JsonlEntryStore::in_data_dir(&data_dir);
        let entries = store.list_insulin_entries(now() - Duration::hours(2)).unwrap();
        assert_eq!(entries.len(), 80);
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = InMemoryEntryStore::with_entries(vec![create_test_entry(1.0, 10)]);
        store.append_insulin_entry(&create_test_entry(2.0, 1)).unwrap();

        assert_eq!(store.entries().len(), 2);
        let recent = store.list_insulin_entries(now() - Duration::hours(4)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].units, 2.0);
    }
}
