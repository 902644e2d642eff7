//! Local record and outbox storage.
//!
//! The engine treats the device's database as an abstract key-addressable
//! store with transactional save. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process, for tests and simulations
//! - [`FileStore`]: a locked directory holding an atomically replaced
//!   CBOR snapshot
//!
//! Every read-compare-write the engine performs (outbox coalescing, the
//! receiver's last-writer-wins merge, ack deletion) runs inside
//! [`Store::transaction`], so two lanes delivering the same record at once
//! cannot interleave between the comparison and the write.

mod file;
mod memory;

pub(crate) use file::sync_directory;
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::SyncResult;
use pairsync_protocol::{OutboxItem, RecordId, SessionRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full contents of a device store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    records: BTreeMap<RecordId, SessionRecord>,
    outbox: BTreeMap<RecordId, OutboxItem>,
}

impl StoreState {
    /// Looks up a record by id.
    pub fn record(&self, id: &RecordId) -> Option<&SessionRecord> {
        self.records.get(id)
    }

    /// All records, tombstoned or not, in id order.
    pub fn records(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.values()
    }

    /// Records matching `predicate`.
    pub fn query(&self, predicate: impl Fn(&SessionRecord) -> bool) -> Vec<SessionRecord> {
        self.records
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// Records without a tombstone.
    pub fn active_records(&self) -> Vec<SessionRecord> {
        self.query(|r| !r.is_deleted())
    }

    /// Number of records, including tombstones.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Looks up an outbox item by dedupe key.
    pub fn outbox_item(&self, key: &RecordId) -> Option<&OutboxItem> {
        self.outbox.get(key)
    }

    /// Pending outbox items, at most `limit`.
    ///
    /// Items never attempted come first, oldest first. The rest follow by
    /// least recent attempt, so repeated drains rotate through an outbox
    /// larger than `limit` instead of resending the same head.
    pub fn pending_outbox(&self, limit: usize) -> Vec<OutboxItem> {
        let mut pending: Vec<&OutboxItem> =
            self.outbox.values().filter(|i| i.is_pending()).collect();
        pending.sort_by_key(|i| (i.last_attempt_at, i.created_at, i.dedupe_key));
        pending.into_iter().take(limit).cloned().collect()
    }

    /// Number of pending outbox items.
    pub fn pending_count(&self) -> usize {
        self.outbox.values().filter(|i| i.is_pending()).count()
    }

    /// Number of outbox items.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }
}

/// Writes staged by a [`Transaction`].
#[derive(Debug, Default)]
pub struct ChangeSet {
    records: BTreeMap<RecordId, SessionRecord>,
    outbox: BTreeMap<RecordId, Option<OutboxItem>>,
}

impl ChangeSet {
    /// Returns true if the transaction wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.outbox.is_empty()
    }

    /// Applies the changes to `state`.
    pub fn apply_to(self, state: &mut StoreState) {
        state.records.extend(self.records);
        for (key, item) in self.outbox {
            match item {
                Some(item) => {
                    state.outbox.insert(key, item);
                }
                None => {
                    state.outbox.remove(&key);
                }
            }
        }
    }
}

/// A consistent view of the store with staged writes.
///
/// Reads see the transaction's own writes.
pub struct Transaction<'a> {
    base: &'a StoreState,
    changes: ChangeSet,
}

impl<'a> Transaction<'a> {
    /// Starts a transaction over `base`.
    pub fn new(base: &'a StoreState) -> Self {
        Self {
            base,
            changes: ChangeSet::default(),
        }
    }

    /// Looks up a record.
    pub fn record(&self, id: &RecordId) -> Option<&SessionRecord> {
        self.changes
            .records
            .get(id)
            .or_else(|| self.base.record(id))
    }

    /// Stages a record write.
    pub fn put_record(&mut self, record: SessionRecord) {
        self.changes.records.insert(record.id, record);
    }

    /// Looks up an outbox item.
    pub fn outbox_item(&self, key: &RecordId) -> Option<&OutboxItem> {
        match self.changes.outbox.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.base.outbox_item(key),
        }
    }

    /// Stages an outbox upsert. An acknowledged item is staged as a delete.
    pub fn put_outbox(&mut self, item: OutboxItem) {
        if item.is_pending() {
            self.changes.outbox.insert(item.dedupe_key, Some(item));
        } else {
            self.delete_outbox(&item.dedupe_key);
        }
    }

    /// Stages an outbox delete. Returns true if an item was visible.
    pub fn delete_outbox(&mut self, key: &RecordId) -> bool {
        let existed = self.outbox_item(key).is_some();
        self.changes.outbox.insert(*key, None);
        existed
    }

    /// Finishes the transaction, returning its writes.
    pub fn into_changes(self) -> ChangeSet {
        self.changes
    }
}

/// A device-local transactional store.
pub trait Store: Send + Sync {
    /// Runs `f` over a consistent view and commits its writes atomically.
    ///
    /// If `f` fails, nothing is written. If the commit fails, the error is
    /// returned and nothing is written.
    fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> SyncResult<R>,
    ) -> SyncResult<R>;

    /// Reads from the committed state.
    fn snapshot<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R;

    /// Looks up a record by id.
    fn get_record(&self, id: &RecordId) -> Option<SessionRecord> {
        self.snapshot(|s| s.record(id).cloned())
    }

    /// Looks up an outbox item by dedupe key.
    fn get_outbox_item(&self, key: &RecordId) -> Option<OutboxItem> {
        self.snapshot(|s| s.outbox_item(key).cloned())
    }

    /// Saves a record.
    fn save_record(&self, record: SessionRecord) -> SyncResult<()> {
        self.transaction(|txn| {
            txn.put_record(record);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairsync_protocol::Timestamp;
    use uuid::Uuid;

    fn record(n: u128) -> SessionRecord {
        SessionRecord::new(
            Uuid::from_u128(n),
            Timestamp::from_secs(10),
            Timestamp::from_secs(20),
        )
    }

    #[test]
    fn transaction_reads_own_writes() {
        let state = StoreState::default();
        let mut txn = Transaction::new(&state);

        assert!(txn.record(&Uuid::from_u128(1)).is_none());
        txn.put_record(record(1));
        assert!(txn.record(&Uuid::from_u128(1)).is_some());

        let item = OutboxItem::new(&record(1), Timestamp::from_secs(1)).unwrap();
        txn.put_outbox(item);
        assert!(txn.outbox_item(&Uuid::from_u128(1)).is_some());
        assert!(txn.delete_outbox(&Uuid::from_u128(1)));
        assert!(txn.outbox_item(&Uuid::from_u128(1)).is_none());
        assert!(!txn.delete_outbox(&Uuid::from_u128(1)));

        let mut state = state.clone();
        txn.into_changes().apply_to(&mut state);
        assert_eq!(state.record_count(), 1);
        assert_eq!(state.outbox_len(), 0);
    }

    #[test]
    fn pending_outbox_is_oldest_first_and_bounded() {
        let mut state = StoreState::default();
        let mut changes = ChangeSet::default();
        for (n, created) in [(1u128, 30i64), (2, 10), (3, 20)] {
            let item = OutboxItem::new(&record(n), Timestamp::from_secs(created)).unwrap();
            changes.outbox.insert(item.dedupe_key, Some(item));
        }
        changes.apply_to(&mut state);

        let keys: Vec<_> = state
            .pending_outbox(2)
            .into_iter()
            .map(|i| i.dedupe_key)
            .collect();
        assert_eq!(keys, vec![Uuid::from_u128(2), Uuid::from_u128(3)]);
    }

    #[test]
    fn pending_outbox_rotates_by_last_attempt() {
        let mut state = StoreState::default();
        let mut changes = ChangeSet::default();
        for (n, attempted) in [(1u128, Some(50i64)), (2, None), (3, Some(40))] {
            let mut item = OutboxItem::new(&record(n), Timestamp::from_secs(10)).unwrap();
            if let Some(at) = attempted {
                item.record_attempt(Timestamp::from_secs(at));
            }
            changes.outbox.insert(item.dedupe_key, Some(item));
        }
        changes.apply_to(&mut state);

        let keys: Vec<_> = state
            .pending_outbox(3)
            .into_iter()
            .map(|i| i.dedupe_key)
            .collect();
        assert_eq!(
            keys,
            vec![Uuid::from_u128(2), Uuid::from_u128(3), Uuid::from_u128(1)]
        );
    }

    #[test]
    fn acked_item_is_staged_as_delete() {
        let mut state = StoreState::default();
        let item = OutboxItem::new(&record(1), Timestamp::from_secs(10)).unwrap();
        let mut txn = Transaction::new(&state);
        txn.put_outbox(item.clone());
        let changes = txn.into_changes();
        changes.apply_to(&mut state);
        assert_eq!(state.outbox_len(), 1);

        let mut acked = item;
        acked.mark_acked();
        let mut txn = Transaction::new(&state);
        txn.put_outbox(acked);
        assert!(txn.outbox_item(&Uuid::from_u128(1)).is_none());
        let changes = txn.into_changes();
        changes.apply_to(&mut state);
        assert_eq!(state.outbox_len(), 0);
    }

    #[test]
    fn active_records_skip_tombstones() {
        let mut state = StoreState::default();
        let mut deleted = record(2);
        deleted.mark_deleted(Timestamp::from_secs(30));

        let mut changes = ChangeSet::default();
        changes.records.insert(Uuid::from_u128(1), record(1));
        changes.records.insert(Uuid::from_u128(2), deleted);
        changes.apply_to(&mut state);

        let active = state.active_records();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, Uuid::from_u128(1));
        assert_eq!(state.record_count(), 2);
    }
}
