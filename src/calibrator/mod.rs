//! Batch calibration orchestration.
//!
//! A [`BatchCalibrator`] owns a [`Model`], lets each of its modules
//! preprocess the current window of measurements, initializes the states,
//! builds a fresh [`CalibrationProblem`](crate::core::CalibrationProblem) and
//! runs Levenberg-Marquardt on it.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod batch;
pub mod model;
pub mod observation;
pub mod storage;

pub use batch::{
    BatchCalibrator, BatchCalibratorOptions, CalibrationReport, Calibrator, OptimizerInspector,
    REPORT_FILE_NAME, create_batch_calibrator,
};
pub use model::{EstimationConfig, Model, Module, add_modules_to_problem};
pub use observation::{BatchObservationManager, ObservationManager};
pub use storage::ModuleStorage;

/// Point in time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Marker for "no timestamp yet".
    pub const INVALID: Timestamp = Timestamp(i64::MIN);

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_secs(secs: f64) -> Self {
        Timestamp((secs * 1e9).round() as i64)
    }

    pub fn nanos(&self) -> i64 {
        self.0
    }

    pub fn to_secs(&self) -> f64 {
        self.0 as f64 * 1e-9
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:.9}s", self.to_secs())
        } else {
            write!(f, "invalid")
        }
    }
}

/// Closed time range `[start, end]`.
///
/// Starts invalid. The first timestamp seeds both bounds; later timestamps
/// only ever widen the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Default for Interval {
    fn default() -> Self {
        Self {
            start: Timestamp::INVALID,
            end: Timestamp::INVALID,
        }
    }
}

impl Interval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.start.is_valid()
    }

    /// Include `t`. Returns whether the interval changed.
    pub fn extend(&mut self, t: Timestamp) -> bool {
        if !self.is_valid() {
            self.start = t;
            self.end = t;
            return true;
        }
        if t < self.start {
            self.start = t;
            return true;
        }
        if t > self.end {
            self.end = t;
            return true;
        }
        false
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.is_valid() && self.start <= t && t <= self.end
    }

    pub fn duration_secs(&self) -> f64 {
        if self.is_valid() {
            (self.end.nanos() - self.start.nanos()) as f64 * 1e-9
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_starts_invalid() {
        let interval = Interval::new();
        assert!(!interval.is_valid());
        assert!(!interval.contains(Timestamp::from_nanos(0)));
        assert_eq!(interval.duration_secs(), 0.0);
    }

    #[test]
    fn test_interval_monotonic_extension() {
        let mut interval = Interval::new();
        assert!(interval.extend(Timestamp::from_secs(5.0)));
        assert_eq!(interval.start, interval.end);

        // inside: unchanged
        assert!(!interval.extend(Timestamp::from_secs(5.0)));
        assert!(interval.extend(Timestamp::from_secs(7.0)));
        assert!(interval.extend(Timestamp::from_secs(2.0)));
        assert!(!interval.extend(Timestamp::from_secs(6.0)));

        assert_eq!(interval.start, Timestamp::from_secs(2.0));
        assert_eq!(interval.end, Timestamp::from_secs(7.0));
        assert!((interval.duration_secs() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_interval_never_shrinks() {
        let mut interval = Interval::new();
        let mut previous: Option<Interval> = None;
        for secs in [3.0, 1.0, 4.0, 1.5, 9.0, 2.6, 5.0] {
            interval.extend(Timestamp::from_secs(secs));
            if let Some(prev) = previous {
                assert!(interval.start <= prev.start);
                assert!(interval.end >= prev.end);
            }
            previous = Some(interval);
        }
    }

    #[test]
    fn test_timestamp_conversions() {
        let t = Timestamp::from_secs(1.25);
        assert_eq!(t.nanos(), 1_250_000_000);
        assert!((t.to_secs() - 1.25).abs() < 1e-12);
        assert!(!Timestamp::INVALID.is_valid());
        assert_eq!(Timestamp::INVALID.to_string(), "invalid");
    }
}
