//! Record builders and temporary directory fixtures.

use pairsync_engine::FileStore;
use pairsync_protocol::{RecordId, SessionRecord, Timestamp};
use std::path::Path;
use tempfile::TempDir;
use uuid::Uuid;

/// Builds session records with readable defaults.
///
/// Ids are derived from a small integer so tests can refer to records by
/// number. The default record starts at 1000 s and was updated at 1000 s.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: SessionRecord,
}

impl RecordBuilder {
    /// Starts a record whose id is derived from `n`.
    pub fn new(n: u128) -> Self {
        Self::with_id(Uuid::from_u128(n))
    }

    /// Starts a record with an explicit id.
    pub fn with_id(id: RecordId) -> Self {
        Self {
            record: SessionRecord::new(id, Timestamp::from_secs(1_000), Timestamp::from_secs(1_000)),
        }
    }

    /// Sets `updatedAt` in seconds.
    pub fn updated(mut self, secs: i64) -> Self {
        self.record.updated_at = Timestamp::from_secs(secs);
        self
    }

    /// Sets the event bounds in seconds.
    pub fn span(mut self, start: i64, end: i64) -> Self {
        self.record.start_date = Timestamp::from_secs(start);
        self.record.end_date = Some(Timestamp::from_secs(end));
        self
    }

    /// Sets the room temperature.
    pub fn temperature(mut self, degrees: f64) -> Self {
        self.record.room_temperature = Some(degrees);
        self
    }

    /// Sets the category.
    pub fn category(mut self, category: Uuid) -> Self {
        self.record.category_id = Some(category);
        self
    }

    /// Sets the free-text note.
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.record.notes = Some(notes.into());
        self
    }

    /// Sets the generated summary.
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.record.generated_summary = Some(summary.into());
        self
    }

    /// Sets the effort rating.
    pub fn effort(mut self, rating: impl Into<String>) -> Self {
        self.record.effort_rating = Some(rating.into());
        self
    }

    /// Sets the manual duration override in seconds.
    pub fn duration_override(mut self, secs: f64) -> Self {
        self.record.duration_override = Some(secs);
        self
    }

    /// Tombstones the record at `secs`, which also becomes `updatedAt`.
    pub fn deleted(mut self, secs: i64) -> Self {
        let at = Timestamp::from_secs(secs);
        self.record.updated_at = at;
        self.record.deleted_at = Some(at);
        self
    }

    /// Finishes the record.
    pub fn build(self) -> SessionRecord {
        self.record
    }
}

/// Shorthand for a record with id `n` updated at `updated_secs`.
pub fn record(n: u128, updated_secs: i64) -> SessionRecord {
    RecordBuilder::new(n).updated(updated_secs).build()
}

/// Runs `f` with a fresh temporary directory that is removed afterwards.
pub fn with_temp_dir<F, R>(f: F) -> R
where
    F: FnOnce(&Path) -> R,
{
    let temp = TempDir::new().expect("Failed to create temp directory");
    f(temp.path())
}

/// A file store in a temporary directory.
pub struct TempFileStore {
    /// The store.
    pub store: FileStore,
    _temp_dir: TempDir,
}

impl TempFileStore {
    /// Opens a store in a new temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(&temp_dir.path().join("store")).expect("Failed to open store");
        Self {
            store,
            _temp_dir: temp_dir,
        }
    }
}

impl Default for TempFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TempFileStore {
    type Target = FileStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairsync_engine::Store;

    #[test]
    fn builder_sets_fields() {
        let rec = RecordBuilder::new(3)
            .span(100, 200)
            .temperature(41.0)
            .notes("hot")
            .effort("hard")
            .duration_override(90.0)
            .updated(250)
            .build();

        assert_eq!(rec.id, Uuid::from_u128(3));
        assert_eq!(rec.end_date, Some(Timestamp::from_secs(200)));
        assert_eq!(rec.room_temperature, Some(41.0));
        assert_eq!(rec.notes.as_deref(), Some("hot"));
        assert_eq!(rec.updated_at, Timestamp::from_secs(250));
        assert!(!rec.is_deleted());
    }

    #[test]
    fn deleted_bumps_updated_at() {
        let rec = RecordBuilder::new(1).deleted(500).build();
        assert!(rec.is_deleted());
        assert_eq!(rec.updated_at, Timestamp::from_secs(500));
    }

    #[test]
    fn temp_file_store_is_usable() {
        let store = TempFileStore::new();
        store.save_record(record(1, 10)).unwrap();
        assert!(store.get_record(&Uuid::from_u128(1)).is_some());
    }

    #[test]
    fn with_temp_dir_exists() {
        with_temp_dir(|path| assert!(path.is_dir()));
    }
}
