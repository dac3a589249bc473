//! Nonlinear least-squares optimization of a [`CalibrationProblem`](crate::core::CalibrationProblem).
//!
//! The batch calibrator drives a Levenberg-Marquardt loop with a sparse
//! Cholesky solve per iteration. Progress is reported through [`OptObserver`]
//! callbacks and `tracing`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ValueStore;
use crate::error::CalibResult;

pub mod levenberg_marquardt;

pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtSummary};

/// Solver configuration.
///
/// Deserializes from the `estimator/optimizer` subtree of the calibrator
/// configuration; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    #[serde(rename = "maxIterations")]
    pub max_iterations: usize,
    /// Convergence tolerance on the cost decrease of an accepted step
    #[serde(rename = "convergenceDeltaJ")]
    pub cost_tolerance: f64,
    /// Convergence tolerance on the step norm
    #[serde(rename = "convergenceDeltaX")]
    pub parameter_tolerance: f64,
    /// Convergence tolerance on the gradient norm
    #[serde(rename = "convergenceGradientNorm")]
    pub gradient_tolerance: f64,
    /// Initial damping parameter λ
    #[serde(rename = "initialLambda")]
    pub initial_lambda: f64,
    /// Wall-clock limit in seconds
    #[serde(rename = "timeout")]
    pub timeout_secs: Option<f64>,
    /// Log every iteration at INFO instead of DEBUG
    pub verbose: bool,
    /// Allow error terms none of whose variables are being estimated
    #[serde(rename = "acceptConstantErrorTerms")]
    pub accept_constant_error_terms: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            initial_lambda: 1e-3,
            timeout_secs: None,
            verbose: false,
            accept_constant_error_terms: false,
        }
    }
}

impl OptimizerConfig {
    /// Create a new solver configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value_store(store: &ValueStore) -> CalibResult<Self> {
        store.deserialize()
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the cost tolerance
    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    /// Set the parameter tolerance
    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the gradient tolerance
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_initial_lambda(mut self, initial_lambda: f64) -> Self {
        self.initial_lambda = initial_lambda;
        self
    }

    /// Set the timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Enable or disable verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_accept_constant_error_terms(mut self, accept: bool) -> Self {
        self.accept_constant_error_terms = accept;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl fmt::Display for OptimizerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizerConfig {{ max_iterations: {}, cost_tolerance: {:e}, parameter_tolerance: {:e}, gradient_tolerance: {:e}, initial_lambda: {:e}, timeout: {:?}, verbose: {}, accept_constant_error_terms: {} }}",
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.initial_lambda,
            self.timeout(),
            self.verbose,
            self.accept_constant_error_terms
        )
    }
}

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Cost function evaluation count
    pub cost_evaluations: usize,
    /// Jacobian evaluation count
    pub jacobian_evaluations: usize,
}

impl fmt::Display for ConvergenceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Optimization converged successfully
    Converged,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Cost function tolerance reached
    CostToleranceReached,
    /// Parameter tolerance reached
    ParameterToleranceReached,
    /// Gradient tolerance reached
    GradientToleranceReached,
    /// Optimization failed due to numerical issues
    NumericalFailure,
    /// Timeout reached
    Timeout,
    /// Other failure
    Failed(String),
}

impl OptimizationStatus {
    /// True for the statuses that mean a convergence criterion was met.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::Failed(msg) => write!(f, "Failed: {msg}"),
        }
    }
}

/// Result of a solver execution.
///
/// The estimated values live in the variable store that was optimized.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Initial cost value
    pub init_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
}

impl fmt::Display for SolverResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} iterations: cost {:.6e} -> {:.6e} in {:?}",
            self.status, self.iterations, self.init_cost, self.final_cost, self.elapsed_time
        )
    }
}

/// State of one Levenberg-Marquardt iteration, as passed to observers.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    /// Cost before the step
    pub cost: f64,
    /// Cost at the trial point
    pub new_cost: f64,
    /// Damping used for this step
    pub lambda: f64,
    pub step_norm: f64,
    pub gradient_norm: f64,
    /// Actual over predicted cost reduction
    pub rho: f64,
    pub accepted: bool,
    /// Rows and columns of the stacked Jacobian
    pub jacobian_shape: (usize, usize),
}

impl fmt::Display for IterationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Iteration {}: cost = {:.6e}, new cost = {:.6e}, lambda = {:.3e}, step_norm = {:.3e}, gradient_norm = {:.3e}, rho = {:.3} [{}]",
            self.iteration,
            self.cost,
            self.new_cost,
            self.lambda,
            self.step_norm,
            self.gradient_norm,
            self.rho,
            if self.accepted { "ACCEPTED" } else { "REJECTED" }
        )
    }
}

/// Callbacks invoked by the optimizer.
pub trait OptObserver: Send + Sync {
    /// Called after every iteration, accepted or not.
    fn on_step(&self, report: &IterationReport);

    /// Called once when the optimizer stops.
    fn on_optimization_complete(&self, _result: &SolverResult) {}
}

/// A list of observers notified in registration order.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Box<dyn OptObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify_step(&self, report: &IterationReport) {
        for observer in &self.observers {
            observer.on_step(report);
        }
    }

    pub fn notify_complete(&self, result: &SolverResult) {
        for observer in &self.observers {
            observer.on_optimization_complete(result);
        }
    }
}

impl fmt::Debug for OptObserverVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptObserverVec({} observers)", self.observers.len())
    }
}
