//! Wall-clock timestamps.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, as carried on the wire.
///
/// The value is kept exactly as received so that two versions which differ
/// on the wire never compare equal. It is always finite, which makes the
/// ordering total.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Timestamp(f64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0.0);

    /// Creates a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis as f64 / 1000.0)
    }

    /// Creates a timestamp from whole seconds since the epoch.
    pub fn from_secs(secs: i64) -> Self {
        Self(secs as f64)
    }

    /// Creates a timestamp from fractional epoch seconds.
    ///
    /// Returns `None` for NaN and infinities.
    pub fn from_secs_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        // Folds -0.0 into 0.0.
        Some(Self(secs + 0.0))
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self(secs)
    }

    /// Fractional seconds since the epoch (the wire representation).
    pub fn as_secs_f64(self) -> f64 {
        self.0
    }

    /// Returns this timestamp advanced by `millis`.
    pub fn saturating_add_millis(self, millis: i64) -> Self {
        let next = self.0 + millis as f64 / 1000.0;
        if next.is_finite() {
            Self(next)
        } else {
            Self(f64::MAX.copysign(next))
        }
    }
}

impl TryFrom<f64> for Timestamp {
    type Error = String;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Self::from_secs_f64(secs).ok_or_else(|| format!("timestamp must be finite, got {secs}"))
    }
}

impl From<Timestamp> for f64 {
    fn from(ts: Timestamp) -> f64 {
        ts.0
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
