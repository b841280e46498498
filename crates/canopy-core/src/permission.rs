//! Colon-delimited permission patterns with wildcard matching.
//!
//! A pattern is a list of segments separated by `:`. Each segment is one of:
//! - `*`, matching any single segment
//! - `a,b,c`, matching any of the listed alternatives
//! - `prefix*`, matching any segment starting with `prefix`
//! - a literal
//!
//! A trailing `*` segment also matches zero or more remaining segments, so
//! `widgets:create:*` implies both `widgets:create` and
//! `widgets:create:123`. Matching is case-insensitive.

use std::fmt;
use std::str::FromStr;

use crate::error::PermissionError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Any,
    Prefix(String),
    OneOf(Vec<String>),
}

impl Segment {
    fn matches(&self, part: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Prefix(prefix) => part.starts_with(prefix.as_str()),
            Segment::OneOf(options) => options.iter().any(|o| o == part),
        }
    }
}

/// A parsed permission grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PermissionPattern {
    pub fn parse(raw: &str) -> Result<Self, PermissionError> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(PermissionError {
                permission: raw.to_string(),
                reason: "permission is empty".to_string(),
            });
        }

        let mut segments = Vec::new();
        for part in normalized.split(':') {
            if part.is_empty() {
                return Err(PermissionError {
                    permission: raw.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            let segment = if part == "*" {
                Segment::Any
            } else if part.contains(',') {
                let options: Vec<String> = part
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect();
                if options.is_empty() {
                    return Err(PermissionError {
                        permission: raw.to_string(),
                        reason: "empty alternative list".to_string(),
                    });
                }
                Segment::OneOf(options)
            } else if let Some(prefix) = part.strip_suffix('*') {
                Segment::Prefix(prefix.to_string())
            } else {
                Segment::OneOf(vec![part.to_string()])
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: normalized,
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this grant authorizes the concrete `required` permission.
    pub fn implies(&self, required: &str) -> bool {
        let required = normalize(required);
        let parts: Vec<&str> = required.split(':').collect();
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            match parts.get(i) {
                Some(part) => {
                    if !segment.matches(part) {
                        return false;
                    }
                    if i == last && *segment == Segment::Any {
                        return true;
                    }
                }
                None => return i == last && *segment == Segment::Any,
            }
        }

        parts.len() == self.segments.len()
    }
}

impl FromStr for PermissionPattern {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PermissionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Canonical spelling of a permission string: trimmed and lower-cased.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// The permission a dispatcher requires for `action` on `resource_type`.
pub fn required_permission(resource_type: &str, action: &str) -> String {
    normalize(&format!("{resource_type}:{action}"))
}

/// True if any of `grants` implies `required`. Unparseable grants never match.
pub fn any_implies<'a, I>(grants: I, required: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    grants.into_iter().any(|grant| match PermissionPattern::parse(grant) {
        Ok(pattern) => pattern.implies(required),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed permission grant");
            false
        }
    })
}
