//! The replicated session record.

use crate::error::{ProtocolError, ProtocolResult};
use crate::time::Timestamp;
use crate::value::{Envelope, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a session record, shared by both devices.
///
/// The id doubles as the outbox dedupe key.
pub type RecordId = Uuid;

/// Wire field names.
pub(crate) mod field {
    pub const DEDUPE_KEY: &str = "dedupeKey";
    pub const ID: &str = "id";
    pub const START_DATE: &str = "startDate";
    pub const END_DATE: &str = "endDate";
    pub const ROOM_TEMPERATURE: &str = "roomTemperature";
    pub const CATEGORY_ID: &str = "categoryId";
    pub const NOTES: &str = "notes";
    pub const GENERATED_SUMMARY: &str = "generatedSummary";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const DELETED_AT: &str = "deletedAt";
    pub const EFFORT_RATING: &str = "effortRating";
    pub const DURATION_OVERRIDE: &str = "durationOverride";
}

/// A session entry replicated from the producer to the consumer.
///
/// # Invariants
///
/// - `id` is assigned once at creation and never changes
/// - `updated_at` is the only conflict-resolution signal; a device must
///   only ever move it forward (see [`SessionRecord::touch`])
/// - a tombstone (`deleted_at`) is an ordinary field change and is
///   replicated like any other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Natural key of the recorded event.
    pub id: RecordId,
    /// Start of the session.
    pub start_date: Timestamp,
    /// End of the session.
    pub end_date: Option<Timestamp>,
    /// Room temperature; absent means unheated.
    pub room_temperature: Option<f64>,
    /// Category tag.
    pub category_id: Option<Uuid>,
    /// Free-text note.
    pub notes: Option<String>,
    /// Generated summary text.
    pub generated_summary: Option<String>,
    /// Perceived effort rating.
    pub effort_rating: Option<String>,
    /// Manual duration override in seconds.
    pub duration_override: Option<f64>,
    /// Last local mutation time.
    pub updated_at: Timestamp,
    /// Tombstone time; present means logically deleted.
    pub deleted_at: Option<Timestamp>,
}

impl SessionRecord {
    /// Creates a record with a fresh random id.
    pub fn create(start_date: Timestamp) -> Self {
        Self::new(Uuid::new_v4(), start_date, Timestamp::now())
    }

    /// Creates a record with the given id and no optional metadata.
    pub fn new(id: RecordId, start_date: Timestamp, updated_at: Timestamp) -> Self {
        Self {
            id,
            start_date,
            end_date: None,
            room_temperature: None,
            category_id: None,
            notes: None,
            generated_summary: None,
            effort_rating: None,
            duration_override: None,
            updated_at,
            deleted_at: None,
        }
    }

    /// Returns true if the record carries a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns true if this copy wins against `other` under last-writer-wins.
    ///
    /// Equal timestamps do not win.
    pub fn supersedes(&self, other: &SessionRecord) -> bool {
        self.updated_at > other.updated_at
    }

    /// Bumps `updated_at` after a local mutation.
    ///
    /// The new value is `now`, or one millisecond past the previous value if
    /// the wall clock has not advanced, so it always moves forward.
    pub fn touch(&mut self, now: Timestamp) {
        let floor = self.updated_at.saturating_add_millis(1);
        self.updated_at = now.max(floor);
    }

    /// Writes a tombstone and bumps `updated_at`.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.touch(now);
        self.deleted_at = Some(self.updated_at);
    }

    /// Writes every field into `envelope` (the `type` tag is left to the caller).
    pub(crate) fn write_fields(&self, envelope: &mut Envelope) {
        let id = self.id.to_string();
        envelope.insert(field::DEDUPE_KEY, id.clone());
        envelope.insert(field::ID, id);
        envelope.insert(field::START_DATE, self.start_date.as_secs_f64());
        envelope.insert_opt(field::END_DATE, self.end_date.map(Timestamp::as_secs_f64));
        envelope.insert_opt(field::ROOM_TEMPERATURE, self.room_temperature);
        envelope.insert_opt(
            field::CATEGORY_ID,
            self.category_id.map(|c| c.to_string()),
        );
        envelope.insert_opt(field::NOTES, self.notes.clone());
        envelope.insert_opt(field::GENERATED_SUMMARY, self.generated_summary.clone());
        envelope.insert(field::UPDATED_AT, self.updated_at.as_secs_f64());
        envelope.insert_opt(field::DELETED_AT, self.deleted_at.map(Timestamp::as_secs_f64));
        envelope.insert_opt(field::EFFORT_RATING, self.effort_rating.clone());
        envelope.insert_opt(field::DURATION_OVERRIDE, self.duration_override);
    }

    /// Reads a record out of a `session` envelope.
    ///
    /// `dedupeKey` (or `id` when the key is absent), `startDate` and
    /// `updatedAt` are required; every other field is optional.
    pub(crate) fn read_fields(envelope: &Envelope) -> ProtocolResult<Self> {
        let fields = Fields(envelope);

        let id = match fields.optional_uuid(field::DEDUPE_KEY)? {
            Some(id) => id,
            None => fields
                .optional_uuid(field::ID)?
                .ok_or(ProtocolError::MissingField {
                    field: field::DEDUPE_KEY,
                })?,
        };
        if id.is_nil() {
            return Err(ProtocolError::invalid_field(field::DEDUPE_KEY, "nil id"));
        }

        Ok(Self {
            id,
            start_date: fields.required_timestamp(field::START_DATE)?,
            end_date: fields.optional_timestamp(field::END_DATE)?,
            room_temperature: fields.optional_number(field::ROOM_TEMPERATURE)?,
            category_id: fields.optional_uuid(field::CATEGORY_ID)?,
            notes: fields.optional_text(field::NOTES)?,
            generated_summary: fields.optional_text(field::GENERATED_SUMMARY)?,
            effort_rating: fields.optional_text(field::EFFORT_RATING)?,
            duration_override: fields.optional_number(field::DURATION_OVERRIDE)?,
            updated_at: fields.required_timestamp(field::UPDATED_AT)?,
            deleted_at: fields.optional_timestamp(field::DELETED_AT)?,
        })
    }
}

/// Typed accessors over an envelope.
pub(crate) struct Fields<'a>(pub(crate) &'a Envelope);

impl Fields<'_> {
    fn mismatch(name: &'static str, expected: &str, found: &Value) -> ProtocolError {
        ProtocolError::invalid_field(
            name,
            format!("expected {expected}, found {}", found.type_name()),
        )
    }

    pub(crate) fn optional_number(&self, name: &'static str) -> ProtocolResult<Option<f64>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(value) => {
                let n = value
                    .as_number()
                    .ok_or_else(|| Self::mismatch(name, "a number", value))?;
                if n.is_finite() {
                    Ok(Some(n))
                } else {
                    Err(ProtocolError::invalid_field(name, "not a finite number"))
                }
            }
        }
    }

    pub(crate) fn optional_timestamp(&self, name: &'static str) -> ProtocolResult<Option<Timestamp>> {
        match self.optional_number(name)? {
            None => Ok(None),
            Some(secs) => Timestamp::from_secs_f64(secs)
                .map(Some)
                .ok_or_else(|| ProtocolError::invalid_field(name, "timestamp out of range")),
        }
    }

    pub(crate) fn required_timestamp(&self, name: &'static str) -> ProtocolResult<Timestamp> {
        self.optional_timestamp(name)?
            .ok_or(ProtocolError::MissingField { field: name })
    }

    pub(crate) fn optional_text(&self, name: &'static str) -> ProtocolResult<Option<String>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(Self::mismatch(name, "text", other)),
        }
    }

    pub(crate) fn optional_uuid(&self, name: &'static str) -> ProtocolResult<Option<Uuid>> {
        match self.optional_text(name)? {
            None => Ok(None),
            Some(text) => Uuid::parse_str(&text)
                .map(Some)
                .map_err(|e| ProtocolError::invalid_field(name, e.to_string())),
        }
    }

    pub(crate) fn required_uuid(&self, name: &'static str) -> ProtocolResult<Uuid> {
        self.optional_uuid(name)?
            .ok_or(ProtocolError::MissingField { field: name })
    }
}
