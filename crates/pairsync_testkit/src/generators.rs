//! Property-based test generators using proptest.
//!
//! Timestamps are whole milliseconds between the epoch and 2100, so
//! distinct generated versions are always distinct on the wire.

use pairsync_protocol::{RecordId, SessionRecord, Timestamp};
use proptest::prelude::*;
use uuid::Uuid;

/// Upper bound for generated timestamps, in milliseconds (year 2100).
const MAX_MILLIS: i64 = 4_102_444_800_000;

/// Strategy for non-nil record ids.
pub fn record_id_strategy() -> impl Strategy<Value = RecordId> {
    (1u128..=u128::MAX).prop_map(Uuid::from_u128)
}

/// Strategy for timestamps between the epoch and 2100.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (0..MAX_MILLIS).prop_map(Timestamp::from_millis)
}

fn optional_text() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-zA-Z ]{0,24}")
}

fn optional_number() -> impl Strategy<Value = Option<f64>> {
    prop::option::of((-500i32..5_000).prop_map(|n| f64::from(n) / 10.0))
}

/// Strategy for a record with `id` and the given `updatedAt`, with every
/// optional field independently present or absent.
pub fn record_with_version(
    id: RecordId,
    updated_at: Timestamp,
) -> impl Strategy<Value = SessionRecord> {
    (
        timestamp_strategy(),
        prop::option::of(timestamp_strategy()),
        optional_number(),
        prop::option::of(record_id_strategy()),
        optional_text(),
        optional_text(),
        optional_text(),
        optional_number(),
        any::<bool>(),
    )
        .prop_map(
            move |(start, end, temp, category, notes, summary, effort, duration, deleted)| {
                let mut record = SessionRecord::new(id, start, updated_at);
                record.end_date = end;
                record.room_temperature = temp;
                record.category_id = category;
                record.notes = notes;
                record.generated_summary = summary;
                record.effort_rating = effort;
                record.duration_override = duration;
                record.deleted_at = deleted.then_some(updated_at);
                record
            },
        )
}

/// Strategy for an arbitrary valid record.
pub fn session_record_strategy() -> impl Strategy<Value = SessionRecord> {
    (record_id_strategy(), timestamp_strategy())
        .prop_flat_map(|(id, updated_at)| record_with_version(id, updated_at))
}

/// Strategy for several versions of one record with distinct `updatedAt`
/// values, in no particular order.
pub fn version_history_strategy(max_versions: usize) -> impl Strategy<Value = Vec<SessionRecord>> {
    let max_versions = max_versions.max(1);
    (
        record_id_strategy(),
        prop::collection::btree_set(0..MAX_MILLIS, 1..=max_versions),
    )
        .prop_flat_map(|(id, versions)| {
            versions
                .into_iter()
                .map(|millis| record_with_version(id, Timestamp::from_millis(millis)))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

/// Strategy for a delivery schedule over `count` messages: a sequence of
/// message indexes with repeats, as produced by two lanes and retries.
///
/// Every index appears at least once.
pub fn delivery_schedule_strategy(count: usize) -> impl Strategy<Value = Vec<usize>> {
    let count = count.max(1);
    prop::collection::vec(0..count, 0..count * 2)
        .prop_map(move |extra| {
            let mut schedule: Vec<usize> = (0..count).collect();
            schedule.extend(extra);
            schedule
        })
        .prop_shuffle()
}
