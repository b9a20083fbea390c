//! Validation errors.

use thiserror::Error;

/// Why a value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationErrorKind {
    /// Empty where a value is required.
    #[error("must not be empty")]
    Empty,

    /// Longer than allowed.
    #[error("{actual} characters, at most {max} allowed")]
    TooLong {
        /// Maximum length.
        max: usize,
        /// Length given.
        actual: usize,
    },

    /// Not in the expected shape.
    #[error("expected {expected}, got '{actual}'")]
    InvalidFormat {
        /// What was expected.
        expected: String,
        /// The rejected input.
        actual: String,
    },

    /// Number outside its range.
    #[error("{actual} is outside [{min}, {max}]")]
    OutOfRange {
        /// Lower bound.
        min: u64,
        /// Upper bound.
        max: u64,
        /// Value given.
        actual: u64,
    },

    /// A list repeats a value.
    #[error("'{value}' appears more than once")]
    Duplicate {
        /// The repeated value.
        value: String,
    },

    /// A character that could change how an external tool reads its
    /// arguments.
    #[error("character {found:?} is not allowed")]
    ForbiddenChar {
        /// The offending character.
        found: char,
    },

    /// Contains a NUL byte.
    #[error("contains a NUL byte")]
    NullByte,
}

/// A rejected input and the field it was given for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {kind}")]
pub struct ValidationError {
    /// Field or argument name.
    pub field: String,
    /// Reason.
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    /// Creates an error for `field`.
    #[must_use]
    pub fn new(field: impl Into<String>, kind: ValidationErrorKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }

    pub(crate) fn empty(field: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::Empty)
    }

    pub(crate) fn too_long(field: impl Into<String>, max: usize, actual: usize) -> Self {
        Self::new(field, ValidationErrorKind::TooLong { max, actual })
    }

    pub(crate) fn invalid_format(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::new(
            field,
            ValidationErrorKind::InvalidFormat {
                expected: expected.into(),
                actual: actual.into(),
            },
        )
    }

    pub(crate) fn out_of_range(field: impl Into<String>, min: u64, max: u64, actual: u64) -> Self {
        Self::new(field, ValidationErrorKind::OutOfRange { min, max, actual })
    }

    pub(crate) fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            field,
            ValidationErrorKind::Duplicate {
                value: value.into(),
            },
        )
    }

    pub(crate) fn forbidden_char(field: impl Into<String>, found: char) -> Self {
        Self::new(field, ValidationErrorKind::ForbiddenChar { found })
    }

    pub(crate) fn null_byte(field: impl Into<String>) -> Self {
        Self::new(field, ValidationErrorKind::NullByte)
    }
}
