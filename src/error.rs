//! Error types for report definition, execution, and input validation.

use std::fmt;

use thiserror::Error;

use crate::cache::CacheError;

/// Result type for report operations.
pub type ReportResult<T> = Result<T, ReportError>;

/// Errors raised while defining or running a report.
#[derive(Error, Debug)]
pub enum ReportError {
    /// User input failed widget validation. Recoverable: fix input and retry.
    #[error("invalid user input: {}", join_messages(.0))]
    Validation(Vec<ValidationError>),

    /// The report definition is inconsistent.
    #[error("invalid report configuration: {0}")]
    Config(String),

    /// A key range or filter referenced an input that was not supplied.
    #[error("user input not found: {0}")]
    MissingInput(String),

    /// An input resolved to a value of the wrong type.
    #[error("user input {name} must be {expected}")]
    InputType { name: String, expected: &'static str },

    /// A range key range was given bounds in the wrong order.
    #[error("start {start} must not be later than end {end}")]
    KeyRangeOrder { start: String, end: String },

    /// The footer was requested before every row had been consumed.
    #[error("the row stream must be exhausted before the footer is available")]
    FooterNotReady,

    /// No report registered under this code name.
    #[error("report not found: {0}")]
    UnknownReport(String),

    /// A column name that the report does not declare.
    #[error("column not found: {0}")]
    UnknownColumn(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl ReportError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Validation errors, if this is a recoverable input failure.
    pub fn validation_errors(&self) -> Option<&[ValidationError]> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

/// A single widget validation failure, shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Failure of a checked arithmetic operation on cell values.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticError {
    /// An operand was missing or not numeric.
    #[error("operand is missing or not numeric")]
    Type,

    #[error("division by zero")]
    DivisionByZero,
}

fn join_messages(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_joins_messages() {
        let err = ReportError::Validation(vec![
            ValidationError::new("Date is not in the correct format."),
            ValidationError::new("Please choose a valid option."),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid user input: Date is not in the correct format.; Please choose a valid option."
        );
        assert_eq!(err.validation_errors().map(<[_]>::len), Some(2));
    }

    #[test]
    fn test_config_error_is_not_validation() {
        let err = ReportError::config("merge reports need exactly one key");
        assert!(err.validation_errors().is_none());
    }
}
