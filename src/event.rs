//! Domain event model.
//!
//! An [`Event`] is an application-level occurrence, independent of any
//! specific broker record. It carries an opaque payload plus an opaque
//! metadata side channel, both conventionally JSON.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Symbolic event name, used as the event's type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub String);

impl EventType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A domain event.
///
/// The id is generated at creation and never reused. `version` is a
/// schema/occurrence version starting at 0, not a concurrency token.
/// `metadata` defaults to an empty JSON object when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub version: u64,
    pub data: Bytes,
    pub metadata: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a generated id, version 0 and empty-object
    /// metadata.
    pub fn new(event_type: impl Into<EventType>, data: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            version: 0,
            data: data.into(),
            metadata: Bytes::from_static(b"{}"),
            timestamp: Utc::now(),
        }
    }

    /// Attach raw metadata bytes, replacing the empty-object default.
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Deserialize the data payload as JSON.
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Deserialize the metadata side channel as JSON.
    pub fn json_metadata<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.metadata)
    }

    /// Serialize and store the given value as the metadata side channel.
    pub fn set_metadata<T: Serialize>(&mut self, metadata: &T) -> Result<(), serde_json::Error> {
        self.metadata = Bytes::from(serde_json::to_vec(metadata)?);
        Ok(())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(Event) id: {}, version: {}, type: {}, metadata: {}, timestamp: {}",
            self.id,
            self.version,
            self.event_type,
            String::from_utf8_lossy(&self.metadata),
            self.timestamp.to_rfc3339(),
        )
    }
}
