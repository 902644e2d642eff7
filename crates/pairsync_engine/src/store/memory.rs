//! In-memory store.

use super::{StoreState, Store, Transaction};
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory store for tests and simulations.
///
/// Commit failures can be injected with [`MemoryStore::set_fail_commits`]
/// to exercise persistence-failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every non-empty commit fail until reset.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of the committed state.
    pub fn state(&self) -> StoreState {
        self.state.read().clone()
    }
}

impl Store for MemoryStore {
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
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::persistence("injected commit failure"));
        }

        changes.apply_to(&mut state);
        Ok(result)
    }

    fn snapshot<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.state.read())
    }
}
