use tracing::trace;

use super::storage::ModuleStorage;
use super::{Interval, Timestamp};

/// Bookkeeping interface modules use while preprocessing a window of measurements.
pub trait ObservationManager {
    fn current_storage(&self) -> &ModuleStorage;

    fn current_storage_mut(&mut self) -> &mut ModuleStorage;

    /// Reference time for [`secs_since_start`](Self::secs_since_start).
    fn set_lowest_timestamp(&mut self, lowest: Timestamp);

    /// Register that `sensor` produced a measurement at `t`.
    fn add_measurement_timestamp(&mut self, t: Timestamp, sensor: &str);

    fn secs_since_start(&self, t: Timestamp) -> f64;

    fn interval_secs_since_start(&self, interval: &Interval) -> String {
        if interval.is_valid() {
            format!(
                "[{:.3}s, {:.3}s]",
                self.secs_since_start(interval.start),
                self.secs_since_start(interval.end)
            )
        } else {
            "[invalid]".to_string()
        }
    }

    fn current_effective_batch_interval(&self) -> &Interval;

    /// Widen the effective batch interval to include `t`; returns whether it changed.
    fn handle_new_time_base_timestamp(&mut self, t: Timestamp) -> bool;
}

/// Observation manager of a batch pass: one growing interval over all data.
#[derive(Debug, Default)]
pub struct BatchObservationManager {
    lowest_timestamp: Option<Timestamp>,
    effective_interval: Interval,
    time_base_sensor: Option<String>,
    storage: ModuleStorage,
}

impl BatchObservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only timestamps of `sensor` define the effective interval.
    pub fn with_time_base_sensor(mut self, sensor: Option<String>) -> Self {
        self.time_base_sensor = sensor;
        self
    }

    pub fn time_base_sensor(&self) -> Option<&str> {
        self.time_base_sensor.as_deref()
    }

    fn is_time_base(&self, sensor: &str) -> bool {
        self.time_base_sensor
            .as_deref()
            .is_none_or(|base| base == sensor)
    }
}

impl ObservationManager for BatchObservationManager {
    fn current_storage(&self) -> &ModuleStorage {
        &self.storage
    }

    fn current_storage_mut(&mut self) -> &mut ModuleStorage {
        &mut self.storage
    }

    fn set_lowest_timestamp(&mut self, lowest: Timestamp) {
        self.lowest_timestamp = Some(lowest);
    }

    fn add_measurement_timestamp(&mut self, t: Timestamp, sensor: &str) {
        if self.lowest_timestamp.is_none_or(|lowest| t < lowest) {
            self.lowest_timestamp = Some(t);
        }
        if self.is_time_base(sensor) && self.handle_new_time_base_timestamp(t) {
            trace!("effective batch interval widened by {sensor} to {:?}", self.effective_interval);
        }
    }

    fn secs_since_start(&self, t: Timestamp) -> f64 {
        let start = self
            .lowest_timestamp
            .or_else(|| self.effective_interval.is_valid().then_some(self.effective_interval.start))
            .unwrap_or(Timestamp::from_nanos(0));
        (t.nanos() - start.nanos()) as f64 * 1e-9
    }

    fn current_effective_batch_interval(&self) -> &Interval {
        &self.effective_interval
    }

    fn handle_new_time_base_timestamp(&mut self, t: Timestamp) -> bool {
        self.effective_interval.extend(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_new_time_base_timestamp() {
        let mut manager = BatchObservationManager::new();
        assert!(manager.handle_new_time_base_timestamp(Timestamp::from_secs(10.0)));
        assert!(!manager.handle_new_time_base_timestamp(Timestamp::from_secs(10.0)));
        assert!(manager.handle_new_time_base_timestamp(Timestamp::from_secs(12.0)));
        assert!(manager.handle_new_time_base_timestamp(Timestamp::from_secs(8.0)));

        let interval = manager.current_effective_batch_interval();
        assert_eq!(interval.start, Timestamp::from_secs(8.0));
        assert_eq!(interval.end, Timestamp::from_secs(12.0));
    }

    #[test]
    fn test_time_base_sensor_filters_interval() {
        let mut manager =
            BatchObservationManager::new().with_time_base_sensor(Some("imu".to_string()));
        manager.add_measurement_timestamp(Timestamp::from_secs(1.0), "camera");
        assert!(!manager.current_effective_batch_interval().is_valid());

        manager.add_measurement_timestamp(Timestamp::from_secs(2.0), "imu");
        manager.add_measurement_timestamp(Timestamp::from_secs(3.0), "imu");
        let interval = *manager.current_effective_batch_interval();
        assert_eq!(interval.start, Timestamp::from_secs(2.0));
        assert_eq!(interval.end, Timestamp::from_secs(3.0));

        // the lowest timestamp still tracks every sensor
        assert!((manager.secs_since_start(Timestamp::from_secs(3.0)) - 2.0).abs() < 1e-9);
        assert_eq!(manager.interval_secs_since_start(&interval), "[1.000s, 2.000s]");
    }

    #[test]
    fn test_any_sensor_is_time_base_by_default() {
        let mut manager = BatchObservationManager::new();
        manager.add_measurement_timestamp(Timestamp::from_secs(4.0), "camera");
        manager.add_measurement_timestamp(Timestamp::from_secs(6.0), "lidar");
        assert!((manager.current_effective_batch_interval().duration_secs() - 2.0).abs() < 1e-9);
        assert_eq!(
            manager.interval_secs_since_start(&Interval::new()),
            "[invalid]"
        );
    }

    #[test]
    fn test_explicit_lowest_timestamp() {
        let mut manager = BatchObservationManager::new();
        manager.set_lowest_timestamp(Timestamp::from_secs(100.0));
        assert!((manager.secs_since_start(Timestamp::from_secs(101.5)) - 1.5).abs() < 1e-9);
    }
}
