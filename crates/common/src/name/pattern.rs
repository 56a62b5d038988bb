use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;

use super::{parse_properties, NameError, ObjectName};

/// Wildcard pattern over object names
///
/// The domain part accepts `*` (any run of characters) and `?` (any single
/// character). The key property part is either `*`, an exact key list, or a
/// key list followed by `,*` which matches names carrying at least those keys.
/// An absent pattern and `*:*` both mean "all objects".
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    domain: Regex,
    properties: PropertyPattern,
}

#[derive(Debug, Clone)]
enum PropertyPattern {
    Any,
    Exact(BTreeMap<String, String>),
    AtLeast(BTreeMap<String, String>),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self, NameError> {
        let (domain, properties) = pattern
            .split_once(':')
            .ok_or_else(|| NameError::MissingDomainSeparator(pattern.to_string()))?;
        if domain.is_empty() {
            return Err(NameError::EmptyDomain(pattern.to_string()));
        }

        let properties = match properties {
            "*" => PropertyPattern::Any,
            p => match p.strip_suffix(",*") {
                Some(keys) => PropertyPattern::AtLeast(parse_properties(pattern, keys)?),
                None => PropertyPattern::Exact(parse_properties(pattern, p)?),
            },
        };

        Ok(Self {
            source: pattern.to_string(),
            domain: glob_to_regex(domain),
            properties,
        })
    }

    /// The `*:*` pattern
    pub fn all() -> Self {
        Self {
            source: "*:*".to_string(),
            domain: glob_to_regex("*"),
            properties: PropertyPattern::Any,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &ObjectName) -> bool {
        if !self.domain.is_match(name.domain()) {
            return false;
        }
        match &self.properties {
            PropertyPattern::Any => true,
            PropertyPattern::Exact(keys) => name.properties() == keys,
            PropertyPattern::AtLeast(keys) => keys
                .iter()
                .all(|(k, v)| name.key_property(k) == Some(v.as_str())),
        }
    }
}

fn glob_to_regex(glob: &str) -> Regex {
    let mut expr = String::with_capacity(glob.len() + 8);
    expr.push('^');
    for c in glob.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    // escaped literals and `.`/`.*` only, always a valid expression
    Regex::new(&expr).unwrap_or_else(|_| unreachable!("escaped glob `{}` is valid", glob))
}

impl PartialEq for NamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for NamePattern {}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for NamePattern {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
