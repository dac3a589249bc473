use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::model::{EstimationConfig, Model};
use super::observation::{BatchObservationManager, ObservationManager};
use super::storage::ModuleStorage;
use crate::config::ValueStore;
use crate::core::problem::CalibrationProblem;
use crate::core::variable::VariableCategory;
use crate::error::{CalibError, CalibResult};
use crate::optimizer::{
    IterationReport, LevenbergMarquardt, OptObserver, OptimizerConfig, SolverResult,
};

/// File written into the output folder after every pass.
pub const REPORT_FILE_NAME: &str = "calibration_report.json";

/// Initial damping of the batch estimation unless `initialLambda` is configured.
const BATCH_INITIAL_LAMBDA: f64 = 100.0;

/// Options read from the root of the calibrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCalibratorOptions {
    pub accept_constant_error_terms: bool,
    /// Folder receiving the report of each pass; nothing is written if unset.
    pub output_folder: Option<PathBuf>,
    /// Sensor whose timestamps define the effective batch interval; any sensor if unset.
    pub time_base_sensor: Option<String>,
    pub verbose: bool,
}

impl Default for BatchCalibratorOptions {
    fn default() -> Self {
        Self {
            accept_constant_error_terms: false,
            output_folder: None,
            time_base_sensor: None,
            verbose: false,
        }
    }
}

impl BatchCalibratorOptions {
    pub fn from_value_store(config: &ValueStore) -> Self {
        let defaults = Self::default();
        let time_base_sensor = config.get_string("timeBaseSensor", "");
        let output_folder = config.get_string("outputFolder", "");
        Self {
            accept_constant_error_terms: config
                .get_bool("acceptConstantErrorTerms", defaults.accept_constant_error_terms),
            output_folder: (!output_folder.is_empty()).then(|| PathBuf::from(output_folder)),
            time_base_sensor: (!time_base_sensor.is_empty()).then_some(time_base_sensor),
            verbose: config.get_bool("verbose", defaults.verbose),
        }
    }
}

/// Final status and calibration values of one pass, serializable for output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub status: String,
    pub converged: bool,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// `(name, value)` of every calibration variable
    pub calibration_variables: Vec<(String, String)>,
}

/// Common interface of calibrators.
pub trait Calibrator {
    /// Run one full calibration pass.
    fn calibrate(&mut self) -> CalibResult<SolverResult>;

    fn options(&self) -> &BatchCalibratorOptions;

    fn current_storage(&mut self) -> &mut ModuleStorage;
}

/// Logs the shape of the system and every optimizer step.
#[derive(Debug, Default)]
pub struct OptimizerInspector {
    verbose: bool,
}

impl OptimizerInspector {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl OptObserver for OptimizerInspector {
    fn on_step(&self, report: &IterationReport) {
        if report.iteration == 0 {
            debug!(
                "The Jacobian matrix is: {} x {}",
                report.jacobian_shape.0, report.jacobian_shape.1
            );
        }
        if self.verbose {
            info!("{report}");
        }
    }

    fn on_optimization_complete(&self, result: &SolverResult) {
        debug!("Optimizer finished: {result}");
        if let Some(info) = &result.convergence_info {
            debug!("{info}");
        }
    }
}

/// Forwards to a shared observer so it can be reused across passes.
struct SharedObserver(Arc<dyn OptObserver>);

impl OptObserver for SharedObserver {
    fn on_step(&self, report: &IterationReport) {
        self.0.on_step(report);
    }

    fn on_optimization_complete(&self, result: &SolverResult) {
        self.0.on_optimization_complete(result);
    }
}

/// Calibrates a [`Model`] over all measurements at once.
pub struct BatchCalibrator<M: Model> {
    config: ValueStore,
    options: BatchCalibratorOptions,
    optimizer_config: OptimizerConfig,
    model: M,
    observations: BatchObservationManager,
    observers: Vec<Arc<dyn OptObserver>>,
    last_result: Option<SolverResult>,
}

/// Build a batch calibrator for `model`.
///
/// The optimizer reads `estimator/optimizer`; the calibrator options read the root.
pub fn create_batch_calibrator<M: Model>(
    config: ValueStore,
    model: M,
) -> CalibResult<BatchCalibrator<M>> {
    BatchCalibrator::new(config, model)
}

impl<M: Model> BatchCalibrator<M> {
    pub fn new(config: ValueStore, model: M) -> CalibResult<Self> {
        let options = BatchCalibratorOptions::from_value_store(&config);

        let optimizer_store = config.child("estimator/optimizer");
        let mut optimizer_config = OptimizerConfig::from_value_store(&optimizer_store)?
            .with_accept_constant_error_terms(options.accept_constant_error_terms);
        if !optimizer_store.has_key("initialLambda") {
            optimizer_config.initial_lambda = BATCH_INITIAL_LAMBDA;
        }

        let observations = BatchObservationManager::new()
            .with_time_base_sensor(options.time_base_sensor.clone());

        Ok(Self {
            config,
            options,
            optimizer_config,
            model,
            observations,
            observers: Vec::new(),
            last_result: None,
        })
    }

    /// Additional observer notified on every optimizer step of every pass.
    pub fn add_observer(&mut self, observer: Arc<dyn OptObserver>) {
        self.observers.push(observer);
    }

    pub fn config(&self) -> &ValueStore {
        &self.config
    }

    pub fn optimizer_config(&self) -> &OptimizerConfig {
        &self.optimizer_config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn observations(&self) -> &BatchObservationManager {
        &self.observations
    }

    pub fn observations_mut(&mut self) -> &mut BatchObservationManager {
        &mut self.observations
    }

    /// Widen the effective batch interval; returns whether it changed.
    pub fn handle_new_time_base_timestamp(&mut self, t: super::Timestamp) -> bool {
        self.observations.handle_new_time_base_timestamp(t)
    }

    pub fn last_result(&self) -> Option<&SolverResult> {
        self.last_result.as_ref()
    }

    /// Report of the last pass; `None` before the first call to `calibrate`.
    pub fn calibration_report(&self) -> Option<CalibrationReport> {
        let result = self.last_result.as_ref()?;
        let calibration_variables = self
            .model
            .variables()
            .iter()
            .filter(|(_, v)| v.category() == VariableCategory::Calibration)
            .map(|(_, v)| (v.name().to_string(), v.value().to_string()))
            .collect();
        Some(CalibrationReport {
            status: result.status.to_string(),
            converged: result.status.is_converged(),
            initial_cost: result.init_cost,
            final_cost: result.final_cost,
            iterations: result.iterations,
            calibration_variables,
        })
    }

    /// Write the report of the last pass as JSON into `folder`.
    pub fn write_report(&self, folder: &Path) -> CalibResult<Option<PathBuf>> {
        let Some(report) = self.calibration_report() else {
            return Ok(None);
        };
        fs::create_dir_all(folder)?;
        let path = folder.join(REPORT_FILE_NAME);
        fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        Ok(Some(path))
    }

    fn build_optimizer(&self) -> LevenbergMarquardt {
        let mut optimizer = LevenbergMarquardt::with_config(self.optimizer_config.clone());
        optimizer.add_observer(Box::new(OptimizerInspector::new(self.options.verbose)));
        for observer in &self.observers {
            optimizer.add_observer(Box::new(SharedObserver(Arc::clone(observer))));
        }
        optimizer
    }

    fn log_cost_breakdown(&self, problem: &CalibrationProblem) -> CalibResult<()> {
        for (group, (count, cost)) in problem.cost_by_group(self.model.variables())? {
            info!(
                "  {group}: {count} error terms, weighted squared error {cost:.6e} (mean {:.6e})",
                cost / count.max(1) as f64
            );
        }
        Ok(())
    }
}

impl<M: Model> Calibrator for BatchCalibrator<M> {
    fn calibrate(&mut self) -> CalibResult<SolverResult> {
        info!("Before calibration:\n{}", self.model.calibration_summary());

        for module in self.model.modules_mut() {
            debug!("Preprocessing window for module {}", module.name());
            module.pre_process_new_window(&mut self.observations)?;
        }
        info!(
            "Starting calibration in interval {}",
            self.observations
                .interval_secs_since_start(self.observations.current_effective_batch_interval())
        );

        if let Err(e) = self.model.init_states(&self.observations) {
            error!("init_states failed: {e}");
            return Err(match e {
                CalibError::Initialization(_) => e,
                other => CalibError::Initialization(other.to_string()),
            });
        }

        let estimation_config = EstimationConfig::batch();
        let mut problem = CalibrationProblem::new();
        self.model.add_to_problem(&estimation_config, &mut problem)?;
        info!(
            "Calibration problem: {} error terms, {} calibration dimensions, {} state dimensions",
            problem.num_error_terms(),
            problem.dim_calibration_variables(),
            problem.dim_state_variables()
        );
        let unconstrained = problem.unconstrained_variables();
        if !unconstrained.is_empty() {
            warn!("{} registered variables have no error terms", unconstrained.len());
        }

        let mut optimizer = self.build_optimizer();
        info!("Optimizer options for batch estimation: {}", self.optimizer_config);
        let result = optimizer.optimize(&problem, self.model.variables_mut())?;
        info!("Final {}", result.status);
        if !result.status.is_converged() {
            warn!("Batch calibration did not converge: {result}");
        }

        info!("Cost per error-term group:");
        self.log_cost_breakdown(&problem)?;
        info!("After calibration:\n{}", self.model.calibration_summary());

        self.last_result = Some(result.clone());
        if let Some(folder) = &self.options.output_folder {
            if let Some(path) = self.write_report(folder)? {
                info!("Calibration report written to {}", path.display());
            }
        }
        Ok(result)
    }

    fn options(&self) -> &BatchCalibratorOptions {
        &self.options
    }

    fn current_storage(&mut self) -> &mut ModuleStorage {
        self.observations.current_storage_mut()
    }
}
