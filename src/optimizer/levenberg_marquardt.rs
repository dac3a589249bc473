//! Levenberg-Marquardt algorithm implementation.
//!
//! Minimizes `Σ rᵢᵀ Wᵢ rᵢ` over the active variables of a
//! [`CalibrationProblem`]. Each iteration:
//! 1. solves `(JᵀJ + λI) δ = −Jᵀr` on the whitened system,
//! 2. applies `δ` to the variables and evaluates the new cost,
//! 3. keeps the step if the cost went down, otherwise reverts the variables
//!    and increases λ. A kept step decreases λ when the gain ratio ρ (actual
//!    over predicted reduction) shows the linear model was good.
//!
//! The system is re-linearized only after an accepted step. Linearization runs
//! in parallel over error terms; the stacked Jacobian is assembled in
//! registration order so results do not depend on scheduling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use faer::Mat;
use faer::sparse::Triplet;
use nalgebra::DVector;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::core::error_term::{ErrorTerm, linearize};
use crate::core::problem::CalibrationProblem;
use crate::core::variable::{VariableId, VariableStore};
use crate::error::{CalibError, CalibResult};
use crate::linalg::{SparseCholeskySolver, SparseLinearSolver, SparseMatrix, sparse_from_triplets};
use crate::optimizer::{
    ConvergenceInfo, IterationReport, OptObserver, OptObserverVec, OptimizationStatus,
    OptimizerConfig, SolverResult,
};

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of iterations performed
    pub iterations: usize,
    /// Number of successful steps (cost decreased)
    pub successful_steps: usize,
    /// Number of unsuccessful steps (cost increased, damping increased)
    pub unsuccessful_steps: usize,
    /// Final damping parameter value
    pub final_damping: f64,
    /// Maximum gradient norm encountered
    pub max_gradient_norm: f64,
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Rows and columns of the stacked Jacobian
    pub jacobian_shape: (usize, usize),
    /// Total time elapsed
    pub total_time: Duration,
}

impl fmt::Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Levenberg-Marquardt Optimization Summary ===")?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "Unsuccessful steps:        {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_damping)?;
        writeln!(f, "Max gradient norm:         {:.6e}", self.max_gradient_norm)?;
        writeln!(f, "Final gradient norm:       {:.6e}", self.final_gradient_norm)?;
        writeln!(
            f,
            "Final param update norm:   {:.6e}",
            self.final_parameter_update_norm
        )?;
        writeln!(
            f,
            "Jacobian:                  {} x {}",
            self.jacobian_shape.0, self.jacobian_shape.1
        )?;
        write!(f, "Total time:                {:?}", self.total_time)
    }
}

/// Column layout of the estimated variables: calibration first, then state.
#[derive(Debug, Clone, Default)]
struct ParameterLayout {
    order: Vec<VariableId>,
    offsets: HashMap<VariableId, usize>,
    dimension: usize,
}

impl ParameterLayout {
    fn new(problem: &CalibrationProblem, store: &VariableStore) -> CalibResult<Self> {
        let mut layout = Self::default();
        for &id in problem
            .calibration_variables()
            .iter()
            .chain(problem.state_variables())
        {
            let variable = store.get(id).ok_or_else(|| {
                CalibError::InvalidInput(format!("problem references unknown variable {id}"))
            })?;
            if !variable.is_active() || layout.offsets.contains_key(&id) {
                continue;
            }
            layout.offsets.insert(id, layout.dimension);
            layout.order.push(id);
            layout.dimension += id.dimension();
        }
        Ok(layout)
    }

    fn offset(&self, id: VariableId) -> Option<usize> {
        self.offsets.get(&id).copied()
    }

    fn is_estimated(&self, term: &dyn ErrorTerm) -> bool {
        term.design_variables()
            .iter()
            .any(|id| self.offsets.contains_key(id))
    }

    /// Apply the stacked step to the store.
    fn apply(&self, step: &Mat<f64>, store: &mut VariableStore) {
        for &id in &self.order {
            let offset = self.offsets[&id];
            let delta = DVector::from_fn(id.dimension(), |i, _| step[(offset + i, 0)]);
            if let Some(variable) = store.get_mut(id) {
                variable.update(delta.as_view());
            }
        }
    }
}

/// Whitened residual and Jacobian of all estimated error terms.
struct LinearSystem {
    residuals: Mat<f64>,
    jacobian: SparseMatrix,
    cost: f64,
}

/// Levenberg-Marquardt solver for the batch calibration problem.
pub struct LevenbergMarquardt {
    config: OptimizerConfig,
    damping: f64,
    damping_min: f64,
    damping_max: f64,
    damping_increase_factor: f64,
    damping_decrease_factor: f64,
    good_step_quality: f64,
    observers: OptObserverVec,
    summary: Option<LevenbergMarquardtSummary>,
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            damping: config.initial_lambda,
            config,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            good_step_quality: 0.75,
            observers: OptObserverVec::new(),
            summary: None,
        }
    }

    /// Set the initial damping parameter.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the damping parameter bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn OptObserver>) {
        self.observers.add(observer);
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Summary of the last call to [`optimize`](Self::optimize).
    pub fn summary(&self) -> Option<&LevenbergMarquardtSummary> {
        self.summary.as_ref()
    }

    /// Adapt the damping after a step; `rho` is only consulted for kept steps.
    fn update_damping(&mut self, accepted: bool, rho: f64) {
        if !accepted {
            self.damping = (self.damping * self.damping_increase_factor).min(self.damping_max);
        } else if rho > self.good_step_quality {
            // Good step, decrease damping
            self.damping = (self.damping * self.damping_decrease_factor).max(self.damping_min);
        }
        // Acceptable step, keep damping unchanged
    }

    /// Split the error terms into estimated and constant ones.
    fn partition_terms(
        &self,
        problem: &CalibrationProblem,
        layout: &ParameterLayout,
    ) -> CalibResult<(Vec<Arc<dyn ErrorTerm>>, Vec<Arc<dyn ErrorTerm>>)> {
        let (estimated, constant): (Vec<_>, Vec<_>) = problem
            .error_terms()
            .iter()
            .cloned()
            .partition(|term| layout.is_estimated(term.as_ref()));

        if !constant.is_empty() && !self.config.accept_constant_error_terms {
            return Err(CalibError::InvalidInput(format!(
                "{} error terms do not depend on any estimated variable (first: {})",
                constant.len(),
                constant[0].name()
            )));
        }
        if !constant.is_empty() {
            debug!("{} constant error terms contribute to the cost only", constant.len());
        }
        Ok((estimated, constant))
    }

    fn cost_of(terms: &[Arc<dyn ErrorTerm>], store: &VariableStore) -> CalibResult<f64> {
        let costs = terms
            .par_iter()
            .map(|term| term.weighted_squared_error(store))
            .collect::<CalibResult<Vec<f64>>>()?;
        Ok(costs.iter().sum())
    }

    /// Linearize every estimated term and stack the whitened system.
    fn linearize_problem(
        terms: &[Arc<dyn ErrorTerm>],
        layout: &ParameterLayout,
        store: &VariableStore,
    ) -> CalibResult<LinearSystem> {
        let linearized = terms
            .par_iter()
            .map(|term| linearize(term.as_ref(), store))
            .collect::<CalibResult<Vec<_>>>()?;

        let rows: usize = linearized.iter().map(|l| l.residual.len()).sum();
        let mut residuals = Mat::zeros(rows, 1);
        let mut triplets = Vec::new();
        let mut cost = 0.0;

        let mut row = 0;
        for term in &linearized {
            for (i, value) in term.residual.iter().enumerate() {
                residuals[(row + i, 0)] = *value;
            }
            for (id, block) in term.jacobians.iter() {
                // Blocks of inactive or unregistered variables are held fixed.
                let Some(col) = layout.offset(id) else {
                    continue;
                };
                for c in 0..block.ncols() {
                    for r in 0..block.nrows() {
                        triplets.push(Triplet::new(row + r, col + c, block[(r, c)]));
                    }
                }
            }
            cost += term.cost;
            row += term.residual.len();
        }

        let jacobian = sparse_from_triplets(rows, layout.dimension, &triplets)?;
        Ok(LinearSystem {
            residuals,
            jacobian,
            cost,
        })
    }

    fn log_step(&self, report: &IterationReport) {
        if self.config.verbose {
            info!("{report}");
        } else {
            debug!("{report}");
        }
    }

    /// Optimize the active variables of `problem` in place.
    ///
    /// Problem-assembly errors are returned as `Err`. A failed linear solve
    /// stops the loop with [`OptimizationStatus::NumericalFailure`] and leaves
    /// the store at the last accepted values.
    pub fn optimize(
        &mut self,
        problem: &CalibrationProblem,
        store: &mut VariableStore,
    ) -> CalibResult<SolverResult> {
        let start_time = Instant::now();
        let layout = ParameterLayout::new(problem, store)?;
        let (estimated, constant) = self.partition_terms(problem, &layout)?;

        let constant_cost = Self::cost_of(&constant, store)?;
        let mut system = Self::linearize_problem(&estimated, &layout, store)?;
        let jacobian_shape = (system.jacobian.nrows(), system.jacobian.ncols());
        let initial_cost = system.cost + constant_cost;
        let mut current_cost = initial_cost;

        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 1;
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut max_gradient_norm: f64 = 0.0;
        let mut final_gradient_norm = 0.0;
        let mut final_parameter_update_norm = 0.0;

        debug!(
            "Starting Levenberg-Marquardt: {} x {} Jacobian, {} estimated / {} constant error terms, initial cost {:.6e}, damping {:.3e}",
            jacobian_shape.0,
            jacobian_shape.1,
            estimated.len(),
            constant.len(),
            initial_cost,
            self.damping
        );

        let mut solver = SparseCholeskySolver::new();
        let mut iteration = 0;

        let status = if layout.dimension == 0 {
            warn!("No active design variables; nothing to optimize");
            OptimizationStatus::Converged
        } else {
            loop {
                if let Some(timeout) = self.config.timeout()
                    && start_time.elapsed() >= timeout
                {
                    break OptimizationStatus::Timeout;
                }
                if iteration >= self.config.max_iterations {
                    break OptimizationStatus::MaxIterationsReached;
                }

                // Solve augmented system: (J^T * J + λI) * dx = -J^T * r
                let step = match solver.solve_augmented_equation(
                    &system.residuals,
                    &system.jacobian,
                    self.damping,
                ) {
                    Ok(step) => step,
                    Err(e) => {
                        warn!("Linear solve failed at iteration {iteration}: {e}");
                        break OptimizationStatus::NumericalFailure;
                    }
                };

                let Some(gradient) = solver.gradient() else {
                    break OptimizationStatus::Failed("solver produced no gradient".to_string());
                };
                let gradient_norm = gradient.norm_l2();
                max_gradient_norm = max_gradient_norm.max(gradient_norm);
                final_gradient_norm = gradient_norm;
                if gradient_norm < self.config.gradient_tolerance {
                    break OptimizationStatus::GradientToleranceReached;
                }

                let step_norm = step.norm_l2();
                final_parameter_update_norm = step_norm;

                // With g = -J^T r and (H + λI) δ = g, the model reduction of
                // ‖r + J δ‖² is 2δᵀg − δᵀHδ = δᵀ(g + λδ).
                let predicted_reduction: f64 = (0..step.nrows())
                    .map(|i| step[(i, 0)] * (gradient[(i, 0)] + self.damping * step[(i, 0)]))
                    .sum();

                let snapshot = store.snapshot();
                layout.apply(&step, store);
                let new_cost = Self::cost_of(&estimated, store)? + constant_cost;
                cost_evaluations += 1;

                let accepted = new_cost.is_finite() && new_cost < current_cost;
                let rho = if predicted_reduction.abs() < 1e-300 {
                    0.0
                } else {
                    (current_cost - new_cost) / predicted_reduction
                };

                let report = IterationReport {
                    iteration,
                    cost: current_cost,
                    new_cost,
                    lambda: self.damping,
                    step_norm,
                    gradient_norm,
                    rho,
                    accepted,
                    jacobian_shape,
                };
                self.log_step(&report);
                self.observers.notify_step(&report);
                iteration += 1;

                if accepted {
                    let cost_reduction = current_cost - new_cost;
                    current_cost = new_cost;
                    successful_steps += 1;
                    self.update_damping(true, rho);

                    system = Self::linearize_problem(&estimated, &layout, store)?;
                    jacobian_evaluations += 1;

                    if cost_reduction < self.config.cost_tolerance {
                        break OptimizationStatus::CostToleranceReached;
                    }
                    if step_norm < self.config.parameter_tolerance {
                        break OptimizationStatus::ParameterToleranceReached;
                    }
                } else {
                    store.restore(snapshot);
                    unsuccessful_steps += 1;
                    if self.damping >= self.damping_max {
                        warn!("Damping reached its upper bound {:.3e}", self.damping_max);
                        break OptimizationStatus::NumericalFailure;
                    }
                    self.update_damping(false, rho);
                }
            }
        };

        let elapsed = start_time.elapsed();
        let summary = LevenbergMarquardtSummary {
            initial_cost,
            final_cost: current_cost,
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            final_damping: self.damping,
            max_gradient_norm,
            final_gradient_norm,
            final_parameter_update_norm,
            jacobian_shape,
            total_time: elapsed,
        };
        if self.config.verbose {
            info!("\n{summary}");
        }
        self.summary = Some(summary);

        let result = SolverResult {
            status,
            init_cost: initial_cost,
            final_cost: current_cost,
            iterations: iteration,
            elapsed_time: elapsed,
            convergence_info: Some(ConvergenceInfo {
                final_gradient_norm,
                final_parameter_update_norm,
                cost_evaluations,
                jacobian_evaluations,
            }),
        };
        self.observers.notify_complete(&result);
        Ok(result)
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LevenbergMarquardt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevenbergMarquardt")
            .field("config", &self.config)
            .field("damping", &self.damping)
            .field("observers", &self.observers)
            .finish()
    }
}
