use std::fmt;

use thiserror::Error;

/// One broken constraint found while validating an entity write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    MissingRequired { property: String },
    ImmutableProperty { property: String },
    TypeMismatch { expected: String, found: String },
    InvalidValue { property: String, reason: String },
}

impl Violation {
    /// The property the violation is about.
    pub fn property(&self) -> &str {
        match self {
            Violation::MissingRequired { property }
            | Violation::ImmutableProperty { property }
            | Violation::InvalidValue { property, .. } => property,
            Violation::TypeMismatch { .. } => crate::entity::PROPERTY_TYPE,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingRequired { property } => {
                write!(f, "required property '{property}' is missing")
            }
            Violation::ImmutableProperty { property } => {
                write!(f, "property '{property}' is immutable")
            }
            Violation::TypeMismatch { expected, found } => {
                write!(f, "type '{found}' does not match '{expected}'")
            }
            Violation::InvalidValue { property, reason } => {
                write!(f, "property '{property}': {reason}")
            }
        }
    }
}

/// Every constraint violated by a create or update, not just the first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed for {entity_type}: {}", join(.violations))]
pub struct ValidationError {
    pub entity_type: String,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// True when at least one violation is an immutable-property write.
    pub fn is_immutable_property(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::ImmutableProperty { .. }))
    }
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A permission string that cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid permission '{permission}': {reason}")]
pub struct PermissionError {
    pub permission: String,
    pub reason: String,
}
