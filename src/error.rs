//! Error types for the batch-calib library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::linalg::LinAlgError;
use std::io::Error;
use thiserror::Error;

/// Main result type used throughout the batch-calib library
pub type CalibResult<T> = Result<T, CalibError>;

/// Main error type for the batch-calib library
#[derive(Debug, Clone, Error)]
pub enum CalibError {
    /// A covariance or information matrix cannot weight a residual (not symmetric positive definite)
    #[error("Singular covariance: {0}")]
    SingularCovariance(String),

    /// State initialization failed; the calibration pass cannot continue
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration lookup or parsing errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO related errors (configuration files, output folders)
    #[error("IO error: {0}")]
    Io(String),
}

impl From<Error> for CalibError {
    fn from(err: Error) -> Self {
        CalibError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CalibError {
    fn from(err: serde_json::Error) -> Self {
        CalibError::Configuration(err.to_string())
    }
}

impl From<LinAlgError> for CalibError {
    fn from(err: LinAlgError) -> Self {
        CalibError::LinearAlgebra(err.to_string())
    }
}
