//! Consumer-owned configuration snapshot.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::{Envelope, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key the envelope format reserves for the message discriminator.
const RESERVED_KEY: &str = "type";

/// A flat key/value bundle of settings pushed from consumer to producer.
///
/// There is no identity or version: every delivery fully replaces the
/// receiver's copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationSnapshot(BTreeMap<String, Value>);

impl ConfigurationSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a setting. The discriminator key `type` cannot be used.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> ProtocolResult<()> {
        let key = key.into();
        if key == RESERVED_KEY {
            return Err(ProtocolError::ReservedKey(key));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> ProtocolResult<Self> {
        self.set(key, value)?;
        Ok(self)
    }

    /// Returns a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of settings.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no settings.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn write_fields(&self, envelope: &mut Envelope) {
        for (key, value) in &self.0 {
            envelope.insert(key.clone(), value.clone());
        }
    }

    /// Everything except the discriminator is a setting.
    pub(crate) fn read_fields(envelope: &Envelope) -> Self {
        Self(
            envelope
                .iter()
                .filter(|(key, _)| *key != RESERVED_KEY)
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_key_rejected() {
        let mut snapshot = ConfigurationSnapshot::new();
        assert_eq!(
            snapshot.set("type", "x"),
            Err(ProtocolError::ReservedKey("type".into()))
        );
        assert!(snapshot.is_empty());
    }

    #[test]
    fn envelope_carries_every_setting() {
        let snapshot = ConfigurationSnapshot::new()
            .with("units", "celsius")
            .unwrap()
            .with("targetMinutes", 15i64)
            .unwrap()
            .with("hapticsEnabled", false)
            .unwrap();

        let mut env = Envelope::new();
        env.insert("type", "config");
        snapshot.write_fields(&mut env);

        assert_eq!(env.len(), 4);
        assert_eq!(ConfigurationSnapshot::read_fields(&env), snapshot);
    }
}
