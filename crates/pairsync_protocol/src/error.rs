//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, validating or (de)serializing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A required envelope field is absent.
    #[error("missing required field `{field}`")]
    MissingField {
        /// Wire name of the field.
        field: &'static str,
    },

    /// A field is present but has the wrong type or an unusable value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Wire name of the field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The envelope's `type` is not one this protocol knows.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The envelope was written by a newer schema.
    #[error("unsupported schema version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version carried by the envelope.
        found: i64,
        /// Highest version this build understands.
        supported: i64,
    },

    /// A key that the envelope format reserves was used as a setting name.
    #[error("reserved key `{0}` cannot be used as a setting")]
    ReservedKey(String),

    /// Failed to encode an envelope to bytes.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Failed to decode bytes into an envelope.
    #[error("decoding failed: {0}")]
    Decoding(String),
}

impl ProtocolError {
    /// Creates an invalid field error.
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true if the envelope was well formed but of a type nobody handles.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, ProtocolError::UnknownType(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_field() {
        let err = ProtocolError::MissingField { field: "updatedAt" };
        assert_eq!(err.to_string(), "missing required field `updatedAt`");

        let err = ProtocolError::invalid_field("startDate", "expected a number");
        assert!(err.to_string().contains("startDate"));
        assert!(err.to_string().contains("expected a number"));
    }

    #[test]
    fn unknown_type_classification() {
        assert!(ProtocolError::UnknownType("ping".into()).is_unknown_type());
        assert!(!ProtocolError::MissingField { field: "id" }.is_unknown_type());
    }
}
