use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::DiscoveryError;

/// Deepest nesting of `(&...)`, `(|...)` and `(!...)` a filter may use
pub const MAX_FILTER_DEPTH: usize = 32;

/// Attribute filter in the usual parenthesised prefix form
///
/// `(key=value)`, `(key=*)` for presence, and `(&...)`, `(|...)`, `(!...)`
/// combinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equals(String, String),
    Present(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn parse(source: &str) -> Result<Self, DiscoveryError> {
        let mut parser = Parser {
            source,
            rest: source.trim(),
            depth: 0,
        };
        let filter = parser.filter()?;
        if !parser.rest.trim().is_empty() {
            return Err(parser.error("trailing input"));
        }
        Ok(filter)
    }

    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            Filter::Equals(key, value) => attributes.get(key) == Some(value),
            Filter::Present(key) => attributes.contains_key(key),
            Filter::And(filters) => filters.iter().all(|f| f.matches(attributes)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attributes)),
            Filter::Not(filter) => !filter.matches(attributes),
        }
    }
}

impl FromStr for Filter {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals(key, value) => write!(f, "({}={})", key, value),
            Filter::Present(key) => write!(f, "({}=*)", key),
            Filter::And(filters) | Filter::Or(filters) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Not(filter) => write!(f, "(!{})", filter),
        }
    }
}

struct Parser<'a> {
    source: &'a str,
    rest: &'a str,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> DiscoveryError {
        DiscoveryError::InvalidSyntax {
            filter: self.source.to_string(),
            reason: reason.to_string(),
        }
    }

    fn expect(&mut self, c: char) -> Result<(), DiscoveryError> {
        self.rest = self.rest.trim_start();
        match self.rest.strip_prefix(c) {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            }
            None => Err(self.error(&format!("expected `{}`", c))),
        }
    }

    fn filter(&mut self) -> Result<Filter, DiscoveryError> {
        self.depth += 1;
        if self.depth > MAX_FILTER_DEPTH {
            return Err(self.error("filter nested too deeply"));
        }
        let filter = self.group();
        self.depth -= 1;
        filter
    }

    fn group(&mut self) -> Result<Filter, DiscoveryError> {
        self.expect('(')?;
        let filter = match self.rest.chars().next() {
            Some('&') => {
                self.rest = &self.rest[1..];
                Filter::And(self.list()?)
            }
            Some('|') => {
                self.rest = &self.rest[1..];
                Filter::Or(self.list()?)
            }
            Some('!') => {
                self.rest = &self.rest[1..];
                Filter::Not(Box::new(self.filter()?))
            }
            _ => self.comparison()?,
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, DiscoveryError> {
        let mut filters = Vec::new();
        while self.rest.trim_start().starts_with('(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn comparison(&mut self) -> Result<Filter, DiscoveryError> {
        let rest = self.rest;
        let end = rest
            .find(')')
            .ok_or_else(|| self.error("unterminated comparison"))?;
        let item = &rest[..end];
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| self.error("comparison needs `=`"))?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || key.contains(['(', '&', '|', '!']) || value.contains('(') {
            return Err(self.error("malformed comparison"));
        }
        self.rest = &rest[end..];
        Ok(if value == "*" {
            Filter::Present(key.to_string())
        } else {
            Filter::Equals(key.to_string(), value.to_string())
        })
    }
}
