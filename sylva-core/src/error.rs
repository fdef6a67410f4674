//! Structured error types for the Sylva workspace.

use thiserror::Error;

/// Unified error type for all Sylva operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SylvaError {
    /// Invalid input (bad arguments, out-of-range values, mismatched lengths)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A parameter vector had the wrong length for the target it configures.
    #[error("invalid parameter count for {what}: expected {expected}, got {got}")]
    InvalidParameterCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Malformed tree topology or branch lengths
    #[error("topology error: {0}")]
    Topology(String),

    /// A likelihood or derived quantity was not finite
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A dense matrix could not be inverted
    #[error("singular matrix: {0}")]
    Singular(String),
}

/// Convenience alias used throughout the Sylva workspace.
pub type Result<T> = std::result::Result<T, SylvaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_count_message_names_the_target() {
        let err = SylvaError::InvalidParameterCount {
            what: "exchangeabilities",
            expected: 5,
            got: 4,
        };
        assert_eq!(
            err.to_string(),
            "invalid parameter count for exchangeabilities: expected 5, got 4"
        );
    }
}
