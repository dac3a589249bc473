//! End-to-end batch calibration on the synthetic offset scenario
//!
//! A body trajectory is measured directly and through a sensor mounted at an
//! unknown translation offset. The batch calibrator must recover the offset
//! from a zero initial guess.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use batch_calib::calibrator::{
    CalibrationReport, Calibrator, EstimationConfig, Model, Module, ObservationManager,
    REPORT_FILE_NAME, Timestamp, create_batch_calibrator,
};
use batch_calib::core::{CalibrationProblem, VariableStore};
use batch_calib::optimizer::{IterationReport, OptObserver};
use batch_calib::synthetic::{OFFSET_SENSOR, SyntheticScenario, TRAJECTORY_SENSOR};
use batch_calib::{CalibError, CalibResult, ValueStore};
use nalgebra::Vector3;

const TIGHT_OPTIMIZER: &str = r#"{
    "maxIterations": 100,
    "convergenceDeltaJ": 1e-20,
    "convergenceDeltaX": 1e-12,
    "convergenceGradientNorm": 1e-12
}"#;

fn tight_config() -> ValueStore {
    ValueStore::from_json_str(&format!(r#"{{ "estimator": {{ "optimizer": {TIGHT_OPTIMIZER} }} }}"#))
        .expect("valid configuration")
}

#[derive(Default)]
struct StepRecorder {
    steps: Mutex<Vec<(f64, f64, bool)>>,
}

impl OptObserver for StepRecorder {
    fn on_step(&self, report: &IterationReport) {
        self.steps
            .lock()
            .unwrap()
            .push((report.cost, report.new_cost, report.accepted));
    }
}

#[test]
fn test_recovers_sensor_offset() {
    let true_offset = Vector3::new(0.1, -0.2, 0.3);
    let scenario = SyntheticScenario::new(20).with_true_offset(true_offset);

    let mut calibrator =
        create_batch_calibrator(tight_config(), scenario.build_model()).expect("calibrator");
    assert_eq!(calibrator.optimizer_config().initial_lambda, 100.0);
    assert_eq!(calibrator.optimizer_config().max_iterations, 100);

    let recorder = Arc::new(StepRecorder::default());
    calibrator.add_observer(recorder.clone());

    let result = calibrator.calibrate().expect("calibration runs");
    assert!(result.status.is_converged(), "status: {}", result.status);
    assert!(result.final_cost < 1e-10, "final cost {}", result.final_cost);
    assert!(result.final_cost <= result.init_cost);

    let estimate = calibrator.model().offset().expect("offset");
    assert!(
        (estimate - true_offset).norm() < 1e-6,
        "estimated {estimate:?}, expected {true_offset:?}"
    );

    // accepted steps never increase the cost
    let steps = recorder.steps.lock().unwrap();
    assert!(!steps.is_empty());
    for (cost, new_cost, accepted) in steps.iter() {
        if *accepted {
            assert!(new_cost < cost);
        }
    }

    let report = calibrator.calibration_report().expect("report after calibrate");
    assert!(report.converged);
    assert_eq!(report.calibration_variables.len(), 1);
    assert_eq!(report.calibration_variables[0].0, "sensor_offset");
    serde_json::to_string(&report).expect("report serializes");
}

#[test]
fn test_recovers_offset_and_states_from_perturbed_start() {
    let true_offset = Vector3::new(0.1, -0.2, 0.3);
    let scenario = SyntheticScenario::new(20)
        .with_true_offset(true_offset)
        .with_state_perturbation(0.05);

    let mut calibrator =
        create_batch_calibrator(tight_config(), scenario.build_model()).expect("calibrator");
    let result = calibrator.calibrate().expect("calibration runs");
    assert!(result.status.is_converged(), "status: {}", result.status);
    assert!(result.init_cost > 1e-4, "initial cost {}", result.init_cost);
    assert!(result.final_cost < 1e-10, "final cost {}", result.final_cost);

    let estimate = calibrator.model().offset().expect("offset");
    assert!(
        (estimate - true_offset).norm() < 1e-6,
        "estimated {estimate:?}, expected {true_offset:?}"
    );

    for k in 0..scenario.num_steps {
        let expected = scenario.true_pose(k);
        let id = calibrator
            .model()
            .state_at(scenario.timestamp(k))
            .expect("state exists");
        let actual = calibrator.model().variables().pose(id).expect("pose state");
        assert!(
            (actual.translation.vector - expected.translation.vector).norm() < 1e-6,
            "state {k} translation"
        );
        assert!(actual.rotation.angle_to(&expected.rotation) < 1e-6, "state {k} rotation");
    }
}

#[test]
fn test_report_written_to_output_folder() {
    let folder = tempfile::tempdir().expect("temporary folder");
    let output = folder.path().join("run");
    let config = ValueStore::from_json_str(&format!(
        r#"{{ "outputFolder": {}, "estimator": {{ "optimizer": {TIGHT_OPTIMIZER} }} }}"#,
        serde_json::to_string(&output).expect("path serializes")
    ))
    .expect("valid configuration");

    let mut calibrator =
        create_batch_calibrator(config, SyntheticScenario::new(6).build_model()).expect("calibrator");
    assert_eq!(calibrator.options().output_folder.as_deref(), Some(output.as_path()));
    calibrator.calibrate().expect("calibration runs");

    let written = std::fs::read_to_string(output.join(REPORT_FILE_NAME)).expect("report file");
    let report: CalibrationReport = serde_json::from_str(&written).expect("report parses");
    assert!(report.converged);
    assert_eq!(report.calibration_variables.len(), 1);
}

#[test]
fn test_recalibration_reuses_states() {
    let scenario = SyntheticScenario::new(8);
    let mut calibrator =
        create_batch_calibrator(tight_config(), scenario.build_model()).expect("calibrator");

    calibrator.calibrate().expect("first pass");
    let variables_after_first = calibrator.model().variables().len();
    let second = calibrator.calibrate().expect("second pass");

    assert_eq!(calibrator.model().variables().len(), variables_after_first);
    assert_eq!(calibrator.model().num_states(), 8);
    assert!(second.final_cost < 1e-10);
}

#[test]
fn test_effective_interval_covers_all_measurements() {
    let scenario = SyntheticScenario::new(11).with_dt(0.5);
    let mut calibrator =
        create_batch_calibrator(tight_config(), scenario.build_model()).expect("calibrator");
    calibrator.calibrate().expect("calibration runs");

    let observations = calibrator.observations();
    let interval = observations.current_effective_batch_interval();
    assert_eq!(interval.start, scenario.timestamp(0));
    assert_eq!(interval.end, scenario.timestamp(10));
    assert_eq!(observations.interval_secs_since_start(interval), "[0.000s, 5.000s]");
    assert!(
        calibrator
            .observations()
            .current_storage()
            .contains(TRAJECTORY_SENSOR)
    );
    assert!(calibrator.current_storage().contains(OFFSET_SENSOR));
}

#[test]
fn test_time_base_sensor_from_config() {
    let config = ValueStore::from_json_str(r#"{ "timeBaseSensor": "offset_sensor" }"#)
        .expect("valid configuration");
    let calibrator =
        create_batch_calibrator(config, SyntheticScenario::new(3).build_model()).expect("calibrator");
    assert_eq!(calibrator.options().time_base_sensor.as_deref(), Some(OFFSET_SENSOR));
    assert_eq!(calibrator.observations().time_base_sensor(), Some(OFFSET_SENSOR));
}

#[test]
fn test_handle_new_time_base_timestamp_widens_interval() {
    let mut calibrator =
        create_batch_calibrator(ValueStore::empty(), SyntheticScenario::new(2).build_model())
            .expect("calibrator");
    assert!(calibrator.handle_new_time_base_timestamp(Timestamp::from_secs(3.0)));
    assert!(!calibrator.handle_new_time_base_timestamp(Timestamp::from_secs(3.0)));
    assert!(calibrator.handle_new_time_base_timestamp(Timestamp::from_secs(1.0)));
    let interval = *calibrator.observations().current_effective_batch_interval();
    assert_eq!(interval.start, Timestamp::from_secs(1.0));
    assert_eq!(interval.end, Timestamp::from_secs(3.0));
}

/// A model whose state initialization always fails.
struct BrokenModel {
    variables: VariableStore,
}

impl Model for BrokenModel {
    fn modules(&self) -> Vec<&dyn Module> {
        Vec::new()
    }

    fn modules_mut(&mut self) -> Vec<&mut dyn Module> {
        Vec::new()
    }

    fn variables(&self) -> &VariableStore {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.variables
    }

    fn init_states(&mut self, _observations: &dyn ObservationManager) -> CalibResult<()> {
        Err(CalibError::InvalidInput("no reference trajectory".to_string()))
    }

    fn add_to_problem(
        &self,
        _config: &EstimationConfig,
        _problem: &mut CalibrationProblem,
    ) -> CalibResult<()> {
        panic!("must not build a problem after a failed initialization");
    }
}

#[test]
fn test_failed_initialization_aborts_calibration() {
    let mut calibrator = create_batch_calibrator(
        ValueStore::empty(),
        BrokenModel {
            variables: VariableStore::new(),
        },
    )
    .expect("calibrator");

    let err = calibrator.calibrate().expect_err("initialization must fail");
    assert!(matches!(err, CalibError::Initialization(_)), "got {err}");
    assert!(calibrator.last_result().is_none());
    assert!(calibrator.calibration_report().is_none());
}

#[test]
fn test_empty_scenario_fails_initialization() {
    let mut calibrator =
        create_batch_calibrator(ValueStore::empty(), SyntheticScenario::new(0).build_model())
            .expect("calibrator");
    assert!(matches!(
        calibrator.calibrate(),
        Err(CalibError::Initialization(_))
    ));
}
