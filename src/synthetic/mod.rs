//! Synthetic calibration scenario
//!
//! A body moves along a deterministic trajectory. One sensor measures the
//! body pose directly; a second sensor sits at an unknown translation offset
//! from the body and measures its own pose. Calibrating recovers the offset.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{DVector, Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibrator::{
    EstimationConfig, Model, Module, ObservationManager, Timestamp, add_modules_to_problem,
};
use crate::core::{
    CalibrationProblem, DesignVariable, TransformExpression, VariableId, VariableStore,
    VariableValue,
};
use crate::error::{CalibError, CalibResult};
use crate::factors::{PoseErrorTerm, PoseMeasurement};

pub const TRAJECTORY_SENSOR: &str = "trajectory";
pub const OFFSET_SENSOR: &str = "offset_sensor";

/// Timestamped pose measurements of one sensor, as shared through module storage.
pub type PoseMeasurements = Arc<Vec<(Timestamp, PoseMeasurement)>>;

/// Parameters of the synthetic scenario. Measurements are noise-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticScenario {
    pub num_steps: usize,
    /// Seconds between two measurements
    pub dt: f64,
    pub true_offset: Vector3<f64>,
    /// Starting guess of the offset
    pub initial_offset: Vector3<f64>,
    /// Scale of the deterministic error added to the initial states
    #[serde(default)]
    pub state_perturbation: f64,
}

impl Default for SyntheticScenario {
    fn default() -> Self {
        Self {
            num_steps: 20,
            dt: 0.1,
            true_offset: Vector3::new(0.1, -0.2, 0.3),
            initial_offset: Vector3::zeros(),
            state_perturbation: 0.0,
        }
    }
}

impl SyntheticScenario {
    pub fn new(num_steps: usize) -> Self {
        Self {
            num_steps,
            ..Self::default()
        }
    }

    pub fn with_true_offset(mut self, offset: Vector3<f64>) -> Self {
        self.true_offset = offset;
        self
    }

    pub fn with_initial_offset(mut self, offset: Vector3<f64>) -> Self {
        self.initial_offset = offset;
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    /// Start the states away from the measured trajectory.
    pub fn with_state_perturbation(mut self, scale: f64) -> Self {
        self.state_perturbation = scale;
        self
    }

    pub fn timestamp(&self, k: usize) -> Timestamp {
        Timestamp::from_secs(k as f64 * self.dt)
    }

    /// Body pose at step `k`: a rising helix with a wobbling orientation.
    pub fn true_pose(&self, k: usize) -> Isometry3<f64> {
        let s = k as f64;
        let translation = Vector3::new(2.0 * (0.3 * s).cos(), 2.0 * (0.3 * s).sin(), 0.1 * s);
        let rotation = UnitQuaternion::from_euler_angles(
            0.2 * (0.5 * s).sin(),
            0.3 * (0.4 * s).cos(),
            0.25 * s,
        );
        Isometry3::from_parts(Translation3::from(translation), rotation)
    }

    pub fn trajectory_measurements(&self) -> Vec<(Timestamp, PoseMeasurement)> {
        (0..self.num_steps)
            .map(|k| {
                (self.timestamp(k), PoseMeasurement::from_isometry(&self.true_pose(k)))
            })
            .collect()
    }

    /// Poses of the offset sensor, `T_k ∘ Translation(b)`.
    pub fn offset_measurements(&self) -> Vec<(Timestamp, PoseMeasurement)> {
        let offset = Isometry3::from_parts(
            Translation3::from(self.true_offset),
            UnitQuaternion::identity(),
        );
        (0..self.num_steps)
            .map(|k| {
                let pose = self.true_pose(k) * offset;
                (self.timestamp(k), PoseMeasurement::from_isometry(&pose))
            })
            .collect()
    }

    pub fn build_model(&self) -> SyntheticModel {
        SyntheticModel::new(
            self.trajectory_measurements(),
            self.offset_measurements(),
            self.initial_offset,
        )
        .with_state_perturbation(self.state_perturbation)
    }
}

/// Local pose error `[δρ; δφ]` of state `k`, bounded by `scale` in translation
/// and `scale / 2` in rotation.
fn state_perturbation(k: usize, scale: f64) -> DVector<f64> {
    let s = k as f64;
    DVector::from_column_slice(&[
        scale * (1.3 * s + 0.2).sin(),
        scale * (0.7 * s).cos(),
        scale * (2.1 * s + 1.0).sin(),
        0.5 * scale * (0.9 * s + 0.4).sin(),
        0.5 * scale * (1.7 * s).cos(),
        0.5 * scale * (1.1 * s + 2.0).sin(),
    ])
}

/// Registers the timestamps of `measurements` and shares them under `sensor`.
fn publish_measurements(
    sensor: &str,
    measurements: &[(Timestamp, PoseMeasurement)],
    observations: &mut dyn ObservationManager,
) {
    for (t, _) in measurements {
        observations.add_measurement_timestamp(*t, sensor);
    }
    let shared: PoseMeasurements = Arc::new(measurements.to_vec());
    observations.current_storage_mut().insert(sensor, shared);
}

/// Measures the body pose directly.
#[derive(Debug, Clone)]
pub struct TrajectorySensor {
    measurements: Vec<(Timestamp, PoseMeasurement)>,
    states: BTreeMap<Timestamp, VariableId>,
}

impl TrajectorySensor {
    pub fn new(measurements: Vec<(Timestamp, PoseMeasurement)>) -> Self {
        Self {
            measurements,
            states: BTreeMap::new(),
        }
    }

    fn bind_states(&mut self, states: &BTreeMap<Timestamp, VariableId>) {
        self.states = states.clone();
    }
}

impl Module for TrajectorySensor {
    fn name(&self) -> &str {
        TRAJECTORY_SENSOR
    }

    fn pre_process_new_window(
        &mut self,
        observations: &mut dyn ObservationManager,
    ) -> CalibResult<()> {
        publish_measurements(TRAJECTORY_SENSOR, &self.measurements, observations);
        Ok(())
    }

    fn add_to_problem(
        &self,
        _config: &EstimationConfig,
        _variables: &VariableStore,
        problem: &mut CalibrationProblem,
    ) -> CalibResult<()> {
        for (t, measurement) in &self.measurements {
            let Some(&state) = self.states.get(t) else {
                debug!("{TRAJECTORY_SENSOR}: no state at {t}, skipping measurement");
                continue;
            };
            let term = PoseErrorTerm::from_measurement(TransformExpression::pose(state), measurement)?
                .with_group(TRAJECTORY_SENSOR);
            problem.add_error_term(Arc::new(term));
        }
        Ok(())
    }
}

/// Rigidly attached to the body at an unknown translation offset.
#[derive(Debug, Clone)]
pub struct OffsetPoseSensor {
    measurements: Vec<(Timestamp, PoseMeasurement)>,
    offset: VariableId,
    states: BTreeMap<Timestamp, VariableId>,
}

impl OffsetPoseSensor {
    pub fn new(measurements: Vec<(Timestamp, PoseMeasurement)>, offset: VariableId) -> Self {
        Self {
            measurements,
            offset,
            states: BTreeMap::new(),
        }
    }

    fn bind_states(&mut self, states: &BTreeMap<Timestamp, VariableId>) {
        self.states = states.clone();
    }
}

impl Module for OffsetPoseSensor {
    fn name(&self) -> &str {
        OFFSET_SENSOR
    }

    fn pre_process_new_window(
        &mut self,
        observations: &mut dyn ObservationManager,
    ) -> CalibResult<()> {
        publish_measurements(OFFSET_SENSOR, &self.measurements, observations);
        Ok(())
    }

    fn add_to_problem(
        &self,
        _config: &EstimationConfig,
        _variables: &VariableStore,
        problem: &mut CalibrationProblem,
    ) -> CalibResult<()> {
        for (t, measurement) in &self.measurements {
            let Some(&state) = self.states.get(t) else {
                debug!("{OFFSET_SENSOR}: no state at {t}, skipping measurement");
                continue;
            };
            let expression = TransformExpression::pose(state)
                .compose(TransformExpression::translation(self.offset));
            let term = PoseErrorTerm::from_measurement(expression, measurement)?
                .with_group(OFFSET_SENSOR);
            problem.add_error_term(Arc::new(term));
        }
        Ok(())
    }
}

/// Body trajectory plus one offset sensor.
#[derive(Debug)]
pub struct SyntheticModel {
    variables: VariableStore,
    offset: VariableId,
    states: BTreeMap<Timestamp, VariableId>,
    state_perturbation: f64,
    trajectory: TrajectorySensor,
    offset_sensor: OffsetPoseSensor,
}

impl SyntheticModel {
    pub fn new(
        trajectory: Vec<(Timestamp, PoseMeasurement)>,
        offset_measurements: Vec<(Timestamp, PoseMeasurement)>,
        initial_offset: Vector3<f64>,
    ) -> Self {
        let mut variables = VariableStore::new();
        let offset = variables.add(DesignVariable::calibration(
            "sensor_offset",
            VariableValue::Euclidean(DVector::from_column_slice(initial_offset.as_slice())),
        ));
        Self {
            variables,
            offset,
            states: BTreeMap::new(),
            state_perturbation: 0.0,
            trajectory: TrajectorySensor::new(trajectory),
            offset_sensor: OffsetPoseSensor::new(offset_measurements, offset),
        }
    }

    /// Initialize states off the measured poses by a deterministic error of this scale.
    pub fn with_state_perturbation(mut self, scale: f64) -> Self {
        self.state_perturbation = scale;
        self
    }

    pub fn offset_id(&self) -> VariableId {
        self.offset
    }

    /// Current estimate of the sensor offset.
    pub fn offset(&self) -> CalibResult<Vector3<f64>> {
        let v = self.variables.vector(self.offset)?;
        Ok(Vector3::new(v[0], v[1], v[2]))
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn state_at(&self, t: Timestamp) -> Option<VariableId> {
        self.states.get(&t).copied()
    }
}

impl Model for SyntheticModel {
    fn modules(&self) -> Vec<&dyn Module> {
        vec![&self.trajectory, &self.offset_sensor]
    }

    fn modules_mut(&mut self) -> Vec<&mut dyn Module> {
        vec![&mut self.trajectory, &mut self.offset_sensor]
    }

    fn variables(&self) -> &VariableStore {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.variables
    }

    /// One pose state per trajectory measurement, initialized to the measured pose
    /// plus the configured perturbation.
    fn init_states(&mut self, observations: &dyn ObservationManager) -> CalibResult<()> {
        let trajectory = observations
            .current_storage()
            .get::<PoseMeasurements>(TRAJECTORY_SENSOR)
            .cloned()
            .ok_or_else(|| {
                CalibError::Initialization(format!(
                    "no {TRAJECTORY_SENSOR} measurements in the current window"
                ))
            })?;
        if trajectory.is_empty() {
            return Err(CalibError::Initialization(format!(
                "{TRAJECTORY_SENSOR} measurements are empty"
            )));
        }

        for (k, (t, measurement)) in trajectory.iter().enumerate() {
            let value = VariableValue::Pose(Isometry3::from_parts(
                Translation3::from(measurement.t),
                measurement.q,
            ));
            let id = match self.states.get(t) {
                Some(&id) => id,
                None => {
                    let id = self
                        .variables
                        .add(DesignVariable::state(format!("T_body@{t}"), value.clone()));
                    self.states.insert(*t, id);
                    id
                }
            };
            let variable = self.variables.get_mut(id).ok_or_else(|| {
                CalibError::Initialization(format!("state {id} missing from the store"))
            })?;
            variable.set_value(value)?;
            if self.state_perturbation != 0.0 {
                variable.update(state_perturbation(k, self.state_perturbation).as_view());
            }
        }
        debug!("initialized {} pose states", self.states.len());

        self.trajectory.bind_states(&self.states);
        self.offset_sensor.bind_states(&self.states);
        Ok(())
    }

    fn add_to_problem(
        &self,
        config: &EstimationConfig,
        problem: &mut CalibrationProblem,
    ) -> CalibResult<()> {
        if config.estimates_spatial_calibration() {
            problem.add_calibration_variable(self.offset);
        }
        if config.state_active {
            for &id in self.states.values() {
                problem.add_state_variable(id);
            }
        }
        add_modules_to_problem(self, config, problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::BatchObservationManager;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn preprocessed(model: &mut SyntheticModel) -> CalibResult<BatchObservationManager> {
        let mut observations = BatchObservationManager::new();
        for module in model.modules_mut() {
            module.pre_process_new_window(&mut observations)?;
        }
        Ok(observations)
    }

    #[test]
    fn test_offset_measurements_consistent_with_truth() {
        let scenario = SyntheticScenario::new(5);
        for ((_, body), (_, sensor)) in scenario
            .trajectory_measurements()
            .iter()
            .zip(scenario.offset_measurements().iter())
        {
            let expected = body.t + body.q * scenario.true_offset;
            assert!((sensor.t - expected).norm() < 1e-12);
            assert!(sensor.q.angle_to(&body.q) < 1e-12);
        }
    }

    #[test]
    fn test_init_states_creates_then_resets() -> TestResult {
        let scenario = SyntheticScenario::new(4);
        let mut model = scenario.build_model();
        let observations = preprocessed(&mut model)?;

        model.init_states(&observations)?;
        assert_eq!(model.num_states(), 4);
        let store_len = model.variables().len();

        let t1 = scenario.timestamp(1);
        let id = model.state_at(t1).ok_or("missing state")?;
        let shifted = VariableValue::Pose(Isometry3::translation(9.0, 9.0, 9.0));
        model
            .variables_mut()
            .get_mut(id)
            .ok_or("missing variable")?
            .set_value(shifted)?;

        // a second initialization resets values without adding variables
        model.init_states(&observations)?;
        assert_eq!(model.variables().len(), store_len);
        let pose = model.variables().pose(id)?;
        assert!((pose.translation.vector - scenario.true_pose(1).translation.vector).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_state_perturbation_is_reapplied_on_reset() -> TestResult {
        let scenario = SyntheticScenario::new(3).with_state_perturbation(0.1);
        let mut model = scenario.build_model();
        let observations = preprocessed(&mut model)?;

        model.init_states(&observations)?;
        let id = model.state_at(scenario.timestamp(2)).ok_or("missing state")?;
        let first = model.variables().pose(id)?;
        let truth = scenario.true_pose(2);
        let error = (first.translation.vector - truth.translation.vector).norm();
        assert!(error > 1e-3 && error < 0.5, "translation error {error}");
        assert!(first.rotation.angle_to(&truth.rotation) > 1e-4);

        model.init_states(&observations)?;
        let second = model.variables().pose(id)?;
        assert!((second.translation.vector - first.translation.vector).norm() < 1e-12);
        assert!(second.rotation.angle_to(&first.rotation) < 1e-12);
        Ok(())
    }

    #[test]
    fn test_inactive_spatial_calibration_keeps_offset_out() -> TestResult {
        let mut model = SyntheticScenario::new(2).build_model();
        let observations = preprocessed(&mut model)?;
        model.init_states(&observations)?;

        let config = EstimationConfig {
            spatial_active: false,
            ..EstimationConfig::batch()
        };
        let mut problem = CalibrationProblem::new();
        model.add_to_problem(&config, &mut problem)?;
        assert_eq!(problem.dim_calibration_variables(), 0);
        assert_eq!(problem.dim_state_variables(), 12);
        assert_eq!(problem.num_error_terms(), 4);
        Ok(())
    }

    #[test]
    fn test_init_states_without_measurements_fails() {
        let mut model = SyntheticScenario::new(0).build_model();
        let observations = BatchObservationManager::new();
        assert!(matches!(
            model.init_states(&observations),
            Err(CalibError::Initialization(_))
        ));
    }

    #[test]
    fn test_add_to_problem_registers_everything() -> TestResult {
        let mut model = SyntheticScenario::new(3).build_model();
        let observations = preprocessed(&mut model)?;
        model.init_states(&observations)?;

        let mut problem = CalibrationProblem::new();
        model.add_to_problem(&EstimationConfig::batch(), &mut problem)?;
        assert_eq!(problem.num_error_terms(), 6);
        assert_eq!(problem.dim_calibration_variables(), 3);
        assert_eq!(problem.dim_state_variables(), 18);
        assert_eq!(problem.errors_for(model.offset_id()).len(), 3);
        assert!(problem.unconstrained_variables().is_empty());

        let groups = problem.cost_by_group(model.variables())?;
        assert_eq!(groups.get(TRAJECTORY_SENSOR).map(|g| g.0), Some(3));
        assert_eq!(groups.get(OFFSET_SENSOR).map(|g| g.0), Some(3));
        Ok(())
    }
}
