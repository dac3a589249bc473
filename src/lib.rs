pub mod calibrator;
pub mod config;
pub mod core;
pub mod error;
pub mod factors;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;
pub mod synthetic;

pub use calibrator::{
    BatchCalibrator, BatchCalibratorOptions, Calibrator, Model, Module, create_batch_calibrator,
};
pub use config::ValueStore;
pub use error::{CalibError, CalibResult};
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{OptimizationStatus, OptimizerConfig, SolverResult};
