//! Common types used throughout SyncBridge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// One of the three actors that can mutate an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// The offline-capable local client.
    Local,
    /// The course-management service.
    SystemA,
    /// The discussion-forum service.
    SystemB,
}

impl Source {
    /// Every source, in tie-break order.
    pub const ALL: [Source; 3] = [Source::Local, Source::SystemA, Source::SystemB];

    /// The two remote sources.
    pub const REMOTES: [Source; 2] = [Source::SystemA, Source::SystemB];

    /// Stable string form used in storage and serialized vectors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Local => "local",
            Source::SystemA => "system_a",
            Source::SystemB => "system_b",
        }
    }

    /// Whether this is one of the remote systems.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Source::Local)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "local" => Ok(Source::Local),
            "system_a" => Ok(Source::SystemA),
            "system_b" => Ok(Source::SystemB),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown source: {}",
                other
            ))),
        }
    }
}

/// Stable logical identity of one record across all sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    entity_type: String,
    entity_id: String,
}

impl EntityRef {
    /// Create a new entity reference.
    ///
    /// # Preconditions
    /// - `entity_type` and `entity_id` must be non-empty
    ///
    /// # Errors
    /// - Returns `InvalidInput` if either part is empty
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> crate::Result<Self> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        if entity_type.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type cannot be empty".to_string(),
            ));
        }
        if entity_id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity id cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            entity_type,
            entity_id,
        })
    }

    /// The entity type (e.g. `assignment`, `topic`).
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The entity id within its type.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// An entity's fields as a JSON object.
///
/// A field holding JSON `null` counts as unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a payload from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(crate::Error::InvalidInput(format!(
                "Payload must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Get a field value, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Get a field only if it is set to something other than `null`.
    pub fn get_set(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// Set a field value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Overlay every field of `other` onto this payload.
    pub fn overlay(&mut self, other: &Payload) {
        for (field, value) in &other.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Iterate over field names.
    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The state of an entity as held by one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "payload", rename_all = "snake_case")]
pub enum EntityState {
    /// The entity exists with these fields.
    Present(Payload),
    /// The entity was deleted (tombstone).
    Deleted,
}

impl EntityState {
    /// Whether this is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self, EntityState::Deleted)
    }

    /// The payload, if the entity is present.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            EntityState::Present(payload) => Some(payload),
            EntityState::Deleted => None,
        }
    }
}
