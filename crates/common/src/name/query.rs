use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ObjectName;

/// Descriptive metadata a remote registry reports for an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub type_name: String,
    pub attributes: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// An object as enumerated from a remote registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub name: ObjectName,
    pub metadata: ObjectMetadata,
}

impl RemoteObject {
    pub fn new(name: ObjectName, metadata: ObjectMetadata) -> Self {
        Self { name, metadata }
    }
}

/// Secondary predicate restricting which remote objects are mounted
///
/// Implementations must be time-invariant: evaluating the query twice
/// against the same object must give the same answer. Agents re-evaluate
/// queries whenever objects appear or connectivity is restored, and a query
/// that depends on changing attribute values makes the mounted set
/// unpredictable.
pub trait ObjectQuery: fmt::Debug + Send + Sync {
    fn matches(&self, name: &ObjectName, metadata: &ObjectMetadata) -> bool;
}

/// Attribute equality query; every listed attribute must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeQuery {
    required: BTreeMap<String, String>,
}

impl AttributeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.insert(attribute.into(), value.into());
        self
    }
}

impl ObjectQuery for AttributeQuery {
    fn matches(&self, _name: &ObjectName, metadata: &ObjectMetadata) -> bool {
        self.required
            .iter()
            .all(|(k, v)| metadata.attribute(k) == Some(v.as_str()))
    }
}
