//! File-backed store.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK         # Advisory lock for single-writer
//! ├─ STATE        # CBOR snapshot of records and outbox
//! └─ STATE.tmp    # Written then renamed over STATE
//! ```

use super::{Store, StoreState, Transaction};
use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "STATE";
const STATE_TEMP: &str = "STATE.tmp";

/// A store persisted to a directory.
///
/// Each commit rewrites the whole snapshot using write-then-rename, so a
/// crash leaves either the previous or the new state on disk, never a mix.
/// The directory is locked for the lifetime of the store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<StoreState>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another process holds the directory, or an I/O or
    /// malformed-message error if the snapshot cannot be read.
    pub fn open(path: &Path) -> SyncResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::Locked {
                path: path.to_path_buf(),
            });
        }

        let state = Self::load(path)?;
        tracing::debug!(
            path = %path.display(),
            records = state.record_count(),
            outbox = state.outbox_len(),
            "opened file store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> SyncResult<StoreState> {
        let state_path = path.join(STATE_FILE);
        if !state_path.exists() {
            return Ok(StoreState::default());
        }
        let data = fs::read(&state_path)?;
        if data.is_empty() {
            return Ok(StoreState::default());
        }
        ciborium::from_reader(data.as_slice())
            .map_err(|e| SyncError::persistence(format!("corrupt store snapshot: {e}")))
    }

    fn persist(&self, state: &StoreState) -> SyncResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(state, &mut data)
            .map_err(|e| SyncError::persistence(e.to_string()))?;

        let temp_path = self.path.join(STATE_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(STATE_FILE))?;
        sync_directory(&self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let mut state = self.state.write();

        let mut txn = Transaction::new(&state);
        let result = f(&mut txn)?;
        let changes = txn.into_changes();
        if changes.is_empty() {
            return Ok(result);
        }

        let mut next = state.clone();
        changes.apply_to(&mut next);
        self.persist(&next).map_err(|e| match e {
            SyncError::Io(io) => SyncError::persistence(io.to_string()),
            other => other,
        })?;
        *state = next;
        Ok(result)
    }

    fn snapshot<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.state.read())
    }
}

/// Fsyncs a directory so a rename inside it is durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> SyncResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> SyncResult<()> {
    // NTFS journals metadata; directory fsync is not available.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairsync_protocol::{OutboxItem, SessionRecord, Timestamp};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn record(n: u128) -> SessionRecord {
        SessionRecord::new(
            Uuid::from_u128(n),
            Timestamp::from_secs(10),
            Timestamp::from_secs(20),
        )
    }

    #[test]
    fn state_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        {
            let store = FileStore::open(&path).unwrap();
            store
                .transaction(|txn| {
                    txn.put_record(record(1));
                    txn.put_outbox(OutboxItem::new(&record(1), Timestamp::from_secs(5)).unwrap());
                    Ok(())
                })
                .unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_record(&Uuid::from_u128(1)), Some(record(1)));
        assert!(store.get_outbox_item(&Uuid::from_u128(1)).is_some());
        assert!(!path.join(STATE_TEMP).exists());
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _store = FileStore::open(temp.path()).unwrap();

        let err = FileStore::open(temp.path()).unwrap_err();
        assert!(matches!(err, SyncError::Locked { .. }));
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(STATE_FILE), [0xff, 0xfe, 0x01]).unwrap();

        let err = FileStore::open(temp.path()).unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));
    }

    #[test]
    fn read_only_transaction_does_not_write() {
        let temp = tempdir().unwrap();
        let store = FileStore::open(temp.path()).unwrap();
        store.transaction(|txn| Ok(txn.record(&Uuid::nil()).is_none())).unwrap();
        assert!(!temp.path().join(STATE_FILE).exists());
    }
}
