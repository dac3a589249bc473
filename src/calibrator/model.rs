use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::observation::ObservationManager;
use crate::core::problem::CalibrationProblem;
use crate::core::variable::{VariableCategory, VariableStore};
use crate::error::CalibResult;

/// Which parts of a model take part in one estimation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimationConfig {
    pub calibration_active: bool,
    pub state_active: bool,
    pub error_terms_active: bool,
    /// Spatial calibration (extrinsic offsets and rotations) is estimated
    pub spatial_active: bool,
}

impl EstimationConfig {
    /// Everything active.
    pub fn batch() -> Self {
        Self {
            calibration_active: true,
            state_active: true,
            error_terms_active: true,
            spatial_active: true,
        }
    }

    /// Whether spatial calibration variables take part in the estimation.
    pub fn estimates_spatial_calibration(&self) -> bool {
        self.calibration_active && self.spatial_active
    }
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self::batch()
    }
}

/// A sensor or other component of a model that contributes measurements.
pub trait Module: Send {
    fn name(&self) -> &str;

    /// Register this window's measurements with the observation manager.
    fn pre_process_new_window(&mut self, _observations: &mut dyn ObservationManager) -> CalibResult<()> {
        Ok(())
    }

    /// Add this module's error terms (and any module-owned variables).
    fn add_to_problem(
        &self,
        config: &EstimationConfig,
        variables: &VariableStore,
        problem: &mut CalibrationProblem,
    ) -> CalibResult<()>;
}

/// The system being calibrated: its modules and the design variables they share.
pub trait Model {
    fn modules(&self) -> Vec<&dyn Module>;

    fn modules_mut(&mut self) -> Vec<&mut dyn Module>;

    fn variables(&self) -> &VariableStore;

    fn variables_mut(&mut self) -> &mut VariableStore;

    /// Create or reset the state variables from the preprocessed window.
    fn init_states(&mut self, observations: &dyn ObservationManager) -> CalibResult<()>;

    /// Register variables and error terms with a fresh problem.
    fn add_to_problem(
        &self,
        config: &EstimationConfig,
        problem: &mut CalibrationProblem,
    ) -> CalibResult<()>;

    /// Human-readable listing of the calibration variables.
    fn calibration_summary(&self) -> String {
        let mut summary = String::new();
        for (_, variable) in self
            .variables()
            .iter()
            .filter(|(_, v)| v.category() == VariableCategory::Calibration)
        {
            let _ = writeln!(summary, "  {variable}");
        }
        summary
    }
}

/// Let every module of `model` add its error terms, in module order.
pub fn add_modules_to_problem<M: Model + ?Sized>(
    model: &M,
    config: &EstimationConfig,
    problem: &mut CalibrationProblem,
) -> CalibResult<()> {
    if !config.error_terms_active {
        return Ok(());
    }
    for module in model.modules() {
        module.add_to_problem(config, model.variables(), problem)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_estimation_config() {
        let config = EstimationConfig::default();
        assert!(config.calibration_active && config.state_active && config.error_terms_active);
        assert!(config.estimates_spatial_calibration());

        let frozen_extrinsics = EstimationConfig {
            spatial_active: false,
            ..EstimationConfig::batch()
        };
        assert!(!frozen_extrinsics.estimates_spatial_calibration());
        let frozen_calibration = EstimationConfig {
            calibration_active: false,
            ..EstimationConfig::batch()
        };
        assert!(!frozen_calibration.estimates_spatial_calibration());
    }
}
