//! Target path translation
//!
//! A target path template such as `/[%s/%s]` is turned into the domain path
//! prefix an endpoint's objects are mounted under. Slots are filled, in order,
//! with the endpoint's host and port, so distinct remote addresses always get
//! distinct prefixes without any global bookkeeping. Reusing one template for
//! logically different sources is the caller's problem.

use crate::remote::EndpointDescriptor;

/// Template used when nothing else is configured
pub const DEFAULT_TARGET_PATH: &str = "/[%s/%s]";

const MAX_SLOTS: usize = 2;

/// Characters a domain path may never contain
const RESERVED: &[char] = &['*', '?', ':', '\n'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathTemplateError {
    #[error("template `{template}` has {slots} substitution slots, at most {MAX_SLOTS} are allowed")]
    TooManySlots { template: String, slots: usize },
    #[error("template `{template}` has {slots} substitution slots but only {arguments} arguments")]
    MissingArgument {
        template: String,
        slots: usize,
        arguments: usize,
    },
    #[error("template `{template}` uses unsupported directive `%{directive}`")]
    UnsupportedDirective { template: String, directive: char },
    #[error("template `{0}` ends with a dangling `%`")]
    DanglingPercent(String),
    #[error("target path `{0}` contains reserved `*`, `?` or `:` characters")]
    ReservedCharacters(String),
    #[error("target path `{0}` is not a valid domain path")]
    Invalid(String),
}

/// Compute the mount prefix for an endpoint
///
/// An absent or empty template yields the empty prefix, i.e. a root mount with
/// no collision protection at all.
pub fn translate(
    template: Option<&str>,
    endpoint: &EndpointDescriptor,
) -> Result<String, PathTemplateError> {
    let template = match template {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(String::new()),
    };
    let port = endpoint.port().to_string();
    let prefix = substitute(template, &[endpoint.host(), &port])?;
    validate(&prefix)?;
    Ok(prefix.trim_end_matches('/').to_string())
}

/// Fill `%s` slots in order; `%%` is a literal `%`
pub fn substitute(template: &str, arguments: &[&str]) -> Result<String, PathTemplateError> {
    let slots = count_slots(template)?;
    if slots > MAX_SLOTS {
        return Err(PathTemplateError::TooManySlots {
            template: template.to_string(),
            slots,
        });
    }
    if slots > arguments.len() {
        return Err(PathTemplateError::MissingArgument {
            template: template.to_string(),
            slots,
            arguments: arguments.len(),
        });
    }

    let mut out = String::with_capacity(template.len() + 16);
    let mut arguments = arguments.iter();
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            // slot count was checked above
            Some(_) => out.push_str(arguments.next().copied().unwrap_or_default()),
            None => unreachable!("dangling `%` rejected by count_slots"),
        }
    }
    Ok(out)
}

fn count_slots(template: &str) -> Result<usize, PathTemplateError> {
    let mut slots = 0;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some('s') => slots += 1,
            Some('%') => {}
            Some(directive) => {
                return Err(PathTemplateError::UnsupportedDirective {
                    template: template.to_string(),
                    directive,
                })
            }
            None => return Err(PathTemplateError::DanglingPercent(template.to_string())),
        }
    }
    Ok(slots)
}

fn validate(prefix: &str) -> Result<(), PathTemplateError> {
    if prefix.contains(RESERVED) {
        return Err(PathTemplateError::ReservedCharacters(prefix.to_string()));
    }
    if prefix.trim_matches('/').trim().is_empty() {
        return Err(PathTemplateError::Invalid(prefix.to_string()));
    }
    Ok(())
}
