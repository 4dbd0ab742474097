//! Errors raised while checking configuration against a schema or diffing
//! attribute trees.

use std::fmt::{self, Display};

use crate::value::AttributePath;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The schema definition itself breaks an invariant.
    #[error("invalid schema: attribute '{attribute}': {reason}")]
    InvalidSchema { attribute: String, reason: String },

    /// The desired configuration does not conform to the schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A tree reached the diff engine with a shape the schema does not allow.
    /// Both trees are validated before diffing, so this is an internal error.
    #[error("schema mismatch at '{path}': {reason}")]
    SchemaMismatch { path: AttributePath, reason: String },
}

/// Every violation found in one desired configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration")?;
        for (i, v) in self.violations.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, v)?;
        }
        Ok(())
    }
}

impl ValidationError {
    /// Whether any violation concerns exactly `path`.
    pub fn mentions(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path.to_string() == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: AttributePath,
    pub reason: ViolationReason,
}

impl Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {}", self.path, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationReason {
    MissingRequired,
    TypeMismatch {
        expected: String,
        found: &'static str,
    },
    UnknownAttribute,
    /// Output-only attributes are set by the backend, never by configuration.
    ComputedOnly,
}

impl Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::MissingRequired => write!(f, "is required but missing"),
            ViolationReason::TypeMismatch { expected, found } => {
                write!(f, "has type {}, expected {}", found, expected)
            }
            ViolationReason::UnknownAttribute => write!(f, "is not defined by the schema"),
            ViolationReason::ComputedOnly => {
                write!(f, "is computed by the backend and cannot be set")
            }
        }
    }
}
