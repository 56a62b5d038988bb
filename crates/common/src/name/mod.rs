//! Object naming
//!
//! Every manageable object is identified by an [`ObjectName`] of the form
//! `<domain>:<key>=<value>[,<key>=<value>...]`. The domain may carry a
//! *domain path* (`server1/instance1/java.lang`), which is how mounted objects
//! are renamed when they are cascaded under a target path.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};

mod pattern;
mod query;

pub use pattern::NamePattern;
pub use query::{AttributeQuery, ObjectMetadata, ObjectQuery, RemoteObject};

/// Characters that turn a name into a pattern
pub(crate) const WILDCARDS: &[char] = &['*', '?'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("`{0}` is missing the `:` domain separator")]
    MissingDomainSeparator(String),
    #[error("`{0}` has an empty domain")]
    EmptyDomain(String),
    #[error("`{0}` has no key properties")]
    EmptyKeyList(String),
    #[error("invalid key property `{property}` in `{name}`")]
    InvalidProperty { name: String, property: String },
    #[error("duplicate key `{key}` in `{name}`")]
    DuplicateKey { name: String, key: String },
    #[error("`{0}` contains wildcard characters")]
    Wildcard(String),
}

/// Name of a manageable object
///
/// Key properties are held in canonical (sorted) order, so two names that
/// list the same properties in a different order are equal.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct ObjectName {
    domain: String,
    properties: BTreeMap<String, String>,
}

impl ObjectName {
    /// Parse a concrete (non-pattern) object name
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let (domain, properties) = name
            .split_once(':')
            .ok_or_else(|| NameError::MissingDomainSeparator(name.to_string()))?;
        if domain.is_empty() {
            return Err(NameError::EmptyDomain(name.to_string()));
        }
        if domain.contains(WILDCARDS) || domain.contains('\n') {
            return Err(NameError::Wildcard(name.to_string()));
        }
        let properties = parse_properties(name, properties)?;
        Ok(Self {
            domain: domain.to_string(),
            properties,
        })
    }

    /// Build a name from a domain and key properties
    pub fn new<I, K, V>(domain: &str, properties: I) -> Result<Self, NameError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let rendered = properties
            .into_iter()
            .map(|(k, v)| format!("{}={}", k.into(), v.into()))
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&format!("{}:{}", domain, rendered))
    }

    /* Getters */

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn key_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Rename this object under a target path
    ///
    /// `D:k=v` becomes `<prefix>/D:k=v`. An empty prefix leaves the name
    /// unchanged (root mount).
    pub fn with_prefix(&self, prefix: &str) -> ObjectName {
        if prefix.is_empty() {
            return self.clone();
        }
        ObjectName {
            domain: format!("{}/{}", prefix, self.domain),
            properties: self.properties.clone(),
        }
    }

    /// Reverse of [`ObjectName::with_prefix`]
    pub fn strip_prefix(&self, prefix: &str) -> Option<ObjectName> {
        if prefix.is_empty() {
            return Some(self.clone());
        }
        let domain = self.domain.strip_prefix(prefix)?.strip_prefix('/')?;
        if domain.is_empty() {
            return None;
        }
        Some(ObjectName {
            domain: domain.to_string(),
            properties: self.properties.clone(),
        })
    }

    /// Whether this name lives under the given domain path
    pub fn is_under(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.strip_prefix(prefix).is_some()
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        for (i, (key, value)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for ObjectName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse a `k=v,k=v` key property list
pub(crate) fn parse_properties(
    name: &str,
    properties: &str,
) -> Result<BTreeMap<String, String>, NameError> {
    if properties.is_empty() {
        return Err(NameError::EmptyKeyList(name.to_string()));
    }
    let mut parsed = BTreeMap::new();
    for property in properties.split(',') {
        let invalid = || NameError::InvalidProperty {
            name: name.to_string(),
            property: property.to_string(),
        };
        let (key, value) = property.split_once('=').ok_or_else(invalid)?;
        if key.is_empty() || value.is_empty() || !valid_token(key) || !valid_token(value) {
            return Err(invalid());
        }
        if parsed.insert(key.to_string(), value.to_string()).is_some() {
            return Err(NameError::DuplicateKey {
                name: name.to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(parsed)
}

fn valid_token(token: &str) -> bool {
    !token.contains(|c: char| matches!(c, ',' | '=' | ':' | '*' | '?' | '\n'))
}
