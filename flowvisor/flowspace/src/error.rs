// Error taxonomy shared by every FlowSpace operation.
//
// Lookup and validation failures are raised while a change is being built and
// abort that submission. The mutation controller contains the same errors per
// entry once a batch is running, so callers branch on `ErrorKind` rather than
// on message text.

use std::fmt;
use thiserror::Error;

/// Coarse classification of a [`FlowSpaceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required attribute was absent from a caller-supplied record
    MissingField,
    /// A name or id lookup found nothing
    NotFound,
    /// Structural violation: duplicate name/id, invalid value or combination
    ConfigError,
    /// A pattern referenced a header field the engine does not know
    UnrecognizedField,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::MissingField => write!(f, "missing-field"),
            ErrorKind::NotFound => write!(f, "not-found"),
            ErrorKind::ConfigError => write!(f, "config-error"),
            ErrorKind::UnrecognizedField => write!(f, "unrecognized-field"),
        }
    }
}

/// Errors raised by the FlowSpace model, the flow map and record parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowSpaceError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("flowspace entry not found: {0}")]
    NotFound(String),

    #[error("invalid flowspace configuration: {0}")]
    ConfigError(String),

    #[error("unrecognized match field: {0}")]
    UnrecognizedField(String),
}

impl FlowSpaceError {
    pub fn missing(field: impl Into<String>) -> Self {
        FlowSpaceError::MissingField(field.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        FlowSpaceError::NotFound(what.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        FlowSpaceError::ConfigError(reason.into())
    }

    pub fn unrecognized(field: impl Into<String>) -> Self {
        FlowSpaceError::UnrecognizedField(field.into())
    }

    /// Returns the kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowSpaceError::MissingField(_) => ErrorKind::MissingField,
            FlowSpaceError::NotFound(_) => ErrorKind::NotFound,
            FlowSpaceError::ConfigError(_) => ErrorKind::ConfigError,
            FlowSpaceError::UnrecognizedField(_) => ErrorKind::UnrecognizedField,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowSpaceError>;
