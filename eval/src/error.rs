// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error types for metric evaluation

use thiserror::Error;

/// Result type alias for evaluation operations
pub type Result<T> = std::result::Result<T, XaiError>;

/// Errors surfaced by metric construction and evaluation
#[derive(Error, Debug)]
pub enum XaiError {
    /// A parameter is illegal or inconsistent with another parameter or the input shape
    #[error("Configuration error: {parameter}: {message}")]
    Config { parameter: String, message: String },

    /// Input data breaks a contract (degenerate attributions, bad masks, length mismatch)
    #[error("Data contract violation: {0}")]
    DataContract(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// The wrapped model refused the request (training mode, channel order conflict)
    #[error("Model error: {0}")]
    Model(String),

    /// The model variant does not provide the requested capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A user-supplied strategy function failed; surfaced unchanged
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl XaiError {
    pub fn config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        XaiError::Config {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub fn shape(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        XaiError::Shape {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

impl From<ndarray::ShapeError> for XaiError {
    fn from(err: ndarray::ShapeError) -> Self {
        XaiError::Shape {
            expected: "compatible layout".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_parameter() {
        let err = XaiError::config("features_in_step", "784 % 3 = 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: features_in_step: 784 % 3 = 1"
        );
    }

    #[test]
    fn test_collaborator_error_is_transparent() {
        let err: XaiError = anyhow::anyhow!("explainer exploded").into();
        assert_eq!(err.to_string(), "explainer exploded");
        assert!(matches!(err, XaiError::Collaborator(_)));
    }
}
