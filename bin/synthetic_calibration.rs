use std::path::PathBuf;
use std::time::Instant;

use batch_calib::calibrator::{Calibrator, create_batch_calibrator};
use batch_calib::synthetic::SyntheticScenario;
use batch_calib::{CalibError, ValueStore, init_logger};
use clap::Parser;
use nalgebra::Vector3;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "synthetic_calibration")]
#[command(about = "Recover a sensor offset from a synthetic trajectory by batch calibration")]
struct Args {
    /// JSON calibrator configuration; optimizer settings live under estimator/optimizer
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of trajectory steps
    #[arg(short, long, default_value = "50")]
    steps: usize,

    /// True sensor offset as x,y,z
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_values_t = [0.1, -0.2, 0.3])]
    offset: Vec<f64>,

    /// Seconds between two measurements
    #[arg(long, default_value = "0.1")]
    dt: f64,

    /// Optional path to save the calibration report as JSON
    #[arg(long)]
    save_output: Option<PathBuf>,
}

fn run(args: Args) -> Result<(), CalibError> {
    let config = match &args.config {
        Some(path) => ValueStore::from_file(path)?,
        None => ValueStore::empty(),
    };

    let offset = match args.offset.as_slice() {
        [x, y, z] => Vector3::new(*x, *y, *z),
        other => {
            return Err(CalibError::InvalidInput(format!(
                "offset needs 3 components, got {}",
                other.len()
            )));
        }
    };
    let scenario = SyntheticScenario::new(args.steps)
        .with_true_offset(offset)
        .with_dt(args.dt);
    info!(
        "Synthetic scenario: {} steps, true offset [{:.4}, {:.4}, {:.4}]",
        scenario.num_steps, offset.x, offset.y, offset.z
    );

    let mut calibrator = create_batch_calibrator(config, scenario.build_model())?;
    let start = Instant::now();
    let result = calibrator.calibrate()?;
    let estimate = calibrator.model().offset()?;
    info!("{result}");
    info!(
        "Estimated offset [{:.6}, {:.6}, {:.6}], error {:.3e} ({:.1} ms)",
        estimate.x,
        estimate.y,
        estimate.z,
        (estimate - offset).norm(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    if let Some(path) = &args.save_output {
        if let Some(report) = calibrator.calibration_report() {
            let json = serde_json::to_string_pretty(&report)?;
            std::fs::write(path, json)?;
            info!("Report written to {}", path.display());
        }
    }
    Ok(())
}

fn main() {
    init_logger();
    if let Err(e) = run(Args::parse()) {
        error!("Calibration failed: {e}");
        std::process::exit(1);
    }
}
