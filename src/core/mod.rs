//! Core calibration components
//!
//! This module contains the building blocks of a batch calibration problem:
//! - Design variables and the arena that owns them
//! - Transform expressions with chain-rule Jacobians
//! - The error-term protocol
//! - Problem assembly

pub mod error_term;
pub mod expression;
pub mod jacobian;
pub mod problem;
pub mod variable;

pub use error_term::{ErrorTerm, LinearizedTerm, linearize, sqrt_information};
pub use expression::TransformExpression;
pub use jacobian::JacobianContainer;
pub use problem::CalibrationProblem;
pub use variable::{DesignVariable, VariableCategory, VariableId, VariableStore, VariableValue};
