//! Type-safe identifiers and session metadata.
//!
//! Newtype wrappers keep session ids and principals from being mixed up
//! with arbitrary strings.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// SessionId
// ============================================================================

/// Identifier of a logical bidirectional connection.
///
/// Unique among the sessions concurrently open in one handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Creates a session id from any string.
    #[inline]
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Generates a random session id (32 lowercase hex characters).
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

// ============================================================================
// Principal
// ============================================================================

/// An authenticated identity attached to a session or message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    name: String,
}

impl Principal {
    /// Creates a principal with the given name.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the principal name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
// SessionAttributes
// ============================================================================

/// Attribute bag shared between a session and the messages it produces.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct SessionAttributes(Arc<RwLock<FxHashMap<String, Value>>>);

impl SessionAttributes {
    /// Creates an empty attribute bag.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the attribute value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.read().get(name).cloned()
    }

    /// Sets an attribute, returning the previous value.
    pub fn insert(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.write().insert(name.into(), value)
    }

    /// Removes an attribute.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.write().remove(name)
    }

    /// Returns the number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Returns `true` if there are no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Returns `true` if both handles share the same map.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_generated_session_ids_are_hex_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::from("abc");
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn test_session_id_serializes_as_string() {
        let id = SessionId::from("abc");

        assert_eq!(serde_json::to_value(&id).unwrap(), json!("abc"));
        let parsed: SessionId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_attributes_are_shared_between_clones() {
        let attrs = SessionAttributes::new();
        let clone = attrs.clone();

        clone.insert("k", json!(1));

        assert_eq!(attrs.get("k"), Some(json!(1)));
        assert!(attrs.same_as(&clone));
        assert!(!attrs.same_as(&SessionAttributes::new()));
    }
}
