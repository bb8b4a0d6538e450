//! Cumulative energy estimation for devices whose own counter cannot be trusted.
//!
//! Two strategies share one persisted state per device:
//! * `estimate` integrates power samples over the real elapsed time.
//! * `reconcile` follows the device counter and hides counter resets by
//!   carrying an offset across them. A drop is only taken as a reset once
//!   the following reading confirms it, single low samples are ignored.
//!
//! State is written through on every call and loaded lazily, so a restarted
//! process resumes where the previous one stopped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EstimatorError;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Contract of the cumulative energy estimator used by the acquisition cycle.
pub trait EnergyEstimator: Send + Sync {
    /// Integrates `power_w` (generation positive) up to now and returns the
    /// exported total in Wh.
    fn estimate(&self, key: &str, power_w: f64) -> Result<f64, EstimatorError>;

    /// Returns the device counter corrected for resets, in Wh.
    fn reconcile(&self, key: &str, device_exported: f64) -> Result<f64, EstimatorError>;
}

/// Builds the persistence key for an inverter component.
pub fn counter_key(device_id: u32, component_id: u32) -> String {
    format!("pv-{device_id}-{component_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    /// Wh drawn while the power sample was negative.
    pub imported: f64,
    pub exported: f64,
    pub last_power: Option<f64>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub device_offset: f64,
    pub last_device_reading: Option<f64>,
    /// Reading before an unconfirmed drop of the device counter.
    #[serde(default)]
    pub pending_reset: Option<f64>,
}

impl CounterState {
    fn integrate(&mut self, power_w: f64, at: DateTime<Utc>) {
        if let (Some(last_power), Some(last_at)) = (self.last_power, self.last_sample_at) {
            let elapsed = at.signed_duration_since(last_at);
            let hours = elapsed.num_milliseconds() as f64 / 1000.0 / SECONDS_PER_HOUR;
            if hours > 0.0 {
                self.exported += trapezoid(last_power.max(0.0), power_w.max(0.0), hours);
                self.imported += trapezoid((-last_power).max(0.0), (-power_w).max(0.0), hours);
            } else {
                debug!(?last_at, ?at, "Sample is not newer than the last one, skipping");
            }
        }
        self.last_power = Some(power_w);
        self.last_sample_at = Some(at);
    }

    fn reconcile(&mut self, device_exported: f64) -> f64 {
        let Some(previous) = self.last_device_reading else {
            self.last_device_reading = Some(device_exported);
            return device_exported + self.device_offset;
        };

        if let Some(before_drop) = self.pending_reset.take() {
            if device_exported >= before_drop {
                debug!(
                    before_drop,
                    current = device_exported,
                    "Device energy counter recovered, ignoring the low reading"
                );
            } else {
                warn!(
                    before_drop,
                    current = device_exported,
                    "Device energy counter reset confirmed, carrying it over"
                );
                self.device_offset += before_drop;
            }
        } else if device_exported < previous {
            // Hold the last total until the next reading tells reset from glitch.
            debug!(
                previous,
                current = device_exported,
                "Device energy counter went backwards"
            );
            self.pending_reset = Some(previous);
            return previous + self.device_offset;
        }

        self.last_device_reading = Some(device_exported);
        device_exported + self.device_offset
    }
}

fn trapezoid(from: f64, to: f64, hours: f64) -> f64 {
    (from + to) / 2.0 * hours
}

/// Where counter state lives between process runs.
pub trait CounterPersistence: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<CounterState>, EstimatorError>;
    fn save(&self, key: &str, state: &CounterState) -> Result<(), EstimatorError>;
}

/// One JSON document per counter key inside a directory.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl CounterPersistence for JsonFilePersistence {
    fn load(&self, key: &str) -> Result<Option<CounterState>, EstimatorError> {
        let raw = match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| EstimatorError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn save(&self, key: &str, state: &CounterState) -> Result<(), EstimatorError> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(state).map_err(|source| EstimatorError::Encode {
            key: key.to_string(),
            source,
        })?;
        // Write then rename so a crash never leaves a half written counter.
        let target = self.path_for(key);
        let staging = target.with_extension("json.tmp");
        fs::write(&staging, body)?;
        fs::rename(&staging, &target)?;
        Ok(())
    }
}

/// Simulated energy counter backed by a persistence layer.
pub struct SimCounter<P> {
    persistence: P,
    states: Mutex<HashMap<String, CounterState>>,
}

impl<P: CounterPersistence> SimCounter<P> {
    pub fn new(persistence: P) -> Self {
        Self {
            persistence,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Same as [`EnergyEstimator::estimate`] with an explicit sample time.
    pub fn estimate_at(
        &self,
        key: &str,
        power_w: f64,
        at: DateTime<Utc>,
    ) -> Result<f64, EstimatorError> {
        self.with_state(key, |state| {
            state.integrate(power_w, at);
            state.exported
        })
    }

    /// Snapshot of the state for `key`, loading it if needed.
    pub fn state(&self, key: &str) -> Result<CounterState, EstimatorError> {
        self.with_state(key, |state| state.clone())
    }

    fn with_state<T>(
        &self,
        key: &str,
        update: impl FnOnce(&mut CounterState) -> T,
    ) -> Result<T, EstimatorError> {
        let mut states = self.states.lock().map_err(|_| EstimatorError::Poisoned)?;
        let state = match states.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let restored = self.persistence.load(key)?;
                if restored.is_some() {
                    debug!(key, "Restored persisted counter state");
                }
                entry.insert(restored.unwrap_or_default())
            }
        };
        // Work on a copy so a failed save leaves the cached state untouched.
        let mut next = state.clone();
        let result = update(&mut next);
        self.persistence.save(key, &next)?;
        *state = next;
        Ok(result)
    }
}

impl<P: CounterPersistence> EnergyEstimator for SimCounter<P> {
    fn estimate(&self, key: &str, power_w: f64) -> Result<f64, EstimatorError> {
        self.estimate_at(key, power_w, Utc::now())
    }

    fn reconcile(&self, key: &str, device_exported: f64) -> Result<f64, EstimatorError> {
        self.with_state(key, |state| state.reconcile(device_exported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::path::Path;
    use tempfile::tempdir;

    const KEY: &str = "pv-1-2";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn counter(dir: &Path) -> SimCounter<JsonFilePersistence> {
        SimCounter::new(JsonFilePersistence::new(dir))
    }

    /// Persistence that fails every operation.
    struct Unavailable;

    impl CounterPersistence for Unavailable {
        fn load(&self, _key: &str) -> Result<Option<CounterState>, EstimatorError> {
            Err(std::io::Error::new(ErrorKind::PermissionDenied, "read only").into())
        }
        fn save(&self, _key: &str, _state: &CounterState) -> Result<(), EstimatorError> {
            Err(std::io::Error::new(ErrorKind::PermissionDenied, "read only").into())
        }
    }

    #[test]
    fn test_counter_key() {
        assert_eq!(counter_key(3, 7), "pv-3-7");
    }

    #[test]
    fn test_first_sample_only_records_baseline() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        assert_eq!(counter.estimate_at(KEY, 5000.0, start()).unwrap(), 0.0);
        let state = counter.state(KEY).unwrap();
        assert_eq!(state.last_power, Some(5000.0));
        assert_eq!(state.last_sample_at, Some(start()));
    }

    #[test]
    fn test_constant_power_integrates_exactly() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        counter.estimate_at(KEY, 1200.0, start()).unwrap();
        let total = counter
            .estimate_at(KEY, 1200.0, start() + Duration::minutes(30))
            .unwrap();
        assert!((total - 600.0).abs() < 1e-9, "got {total}");
    }

    #[test]
    fn test_irregular_intervals_use_real_elapsed_time() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        counter.estimate_at(KEY, 1000.0, start()).unwrap();
        counter
            .estimate_at(KEY, 1000.0, start() + Duration::seconds(10))
            .unwrap();
        // A skipped stretch of several minutes is still integrated in full.
        let total = counter
            .estimate_at(KEY, 1000.0, start() + Duration::seconds(370))
            .unwrap();
        assert!((total - 1000.0 * 370.0 / 3600.0).abs() < 1e-9, "got {total}");
    }

    #[test]
    fn test_negative_power_never_decreases_exported() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        let mut at = start();
        let mut previous = counter.estimate_at(KEY, 800.0, at).unwrap();
        for power in [800.0, -300.0, -1500.0, 0.0, 200.0, -50.0] {
            at = at + Duration::seconds(60);
            let total = counter.estimate_at(KEY, power, at).unwrap();
            assert!(total >= previous, "{total} < {previous} after {power}W");
            previous = total;
        }
        assert!(counter.state(KEY).unwrap().imported > 0.0);
    }

    #[test]
    fn test_only_negative_power_keeps_exported_at_zero() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        counter.estimate_at(KEY, -400.0, start()).unwrap();
        let total = counter
            .estimate_at(KEY, -400.0, start() + Duration::hours(1))
            .unwrap();
        assert_eq!(total, 0.0);
        assert!((counter.state(KEY).unwrap().imported - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_step_back_adds_nothing() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        counter.estimate_at(KEY, 1000.0, start()).unwrap();
        let total = counter
            .estimate_at(KEY, 1000.0, start() - Duration::minutes(5))
            .unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_resumes_after_restart() {
        let dir = tempdir().unwrap();
        {
            let counter = counter(dir.path());
            counter.estimate_at(KEY, 600.0, start()).unwrap();
            counter
                .estimate_at(KEY, 600.0, start() + Duration::hours(1))
                .unwrap();
        }
        let restarted = counter(dir.path());
        let total = restarted
            .estimate_at(KEY, 600.0, start() + Duration::hours(2))
            .unwrap();
        assert!((total - 1200.0).abs() < 1e-9, "got {total}");
    }

    #[test]
    fn test_counters_are_keyed_per_device() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        counter.estimate_at("pv-1-1", 1000.0, start()).unwrap();
        counter.estimate_at("pv-2-1", 10.0, start()).unwrap();
        let one = counter
            .estimate_at("pv-1-1", 1000.0, start() + Duration::hours(1))
            .unwrap();
        let two = counter
            .estimate_at("pv-2-1", 10.0, start() + Duration::hours(1))
            .unwrap();
        assert!((one - 1000.0).abs() < 1e-9);
        assert!((two - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_reconcile_passes_through_increasing_counter() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        assert_eq!(counter.reconcile(KEY, 100.0).unwrap(), 100.0);
        assert_eq!(counter.reconcile(KEY, 100.0).unwrap(), 100.0);
        assert_eq!(counter.reconcile(KEY, 250.5).unwrap(), 250.5);
    }

    #[test]
    fn test_reconcile_carries_offset_over_reset() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        assert_eq!(counter.reconcile(KEY, 1000.0).unwrap(), 1000.0);
        assert_eq!(counter.reconcile(KEY, 0.0).unwrap(), 1000.0);
        assert_eq!(counter.reconcile(KEY, 25.0).unwrap(), 1025.0);
        // A second reset stacks on top of the first one.
        assert_eq!(counter.reconcile(KEY, 5.0).unwrap(), 1025.0);
        assert_eq!(counter.reconcile(KEY, 8.0).unwrap(), 1033.0);
    }

    #[test]
    fn test_reconcile_ignores_single_low_reading() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        let published: Vec<f64> = [1000.0, 0.0, 1000.0, 1001.0]
            .into_iter()
            .map(|reading| counter.reconcile(KEY, reading).unwrap())
            .collect();
        assert_eq!(published, vec![1000.0, 1000.0, 1000.0, 1001.0]);
        assert_eq!(counter.state(KEY).unwrap().device_offset, 0.0);
    }

    #[test]
    fn test_reconcile_recovered_counter_starts_over() {
        let dir = tempdir().unwrap();
        let counter = counter(dir.path());
        counter.reconcile(KEY, 500.0).unwrap();
        assert_eq!(counter.reconcile(KEY, 3.0).unwrap(), 500.0);
        assert_eq!(counter.reconcile(KEY, 510.0).unwrap(), 510.0);
        // The held drop was discarded, a later drop starts over.
        assert_eq!(counter.reconcile(KEY, 0.0).unwrap(), 510.0);
        assert_eq!(counter.reconcile(KEY, 0.0).unwrap(), 510.0);
        assert_eq!(counter.reconcile(KEY, 1.5).unwrap(), 511.5);
    }

    #[test]
    fn test_state_without_pending_reset_still_loads() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(format!("{KEY}.json")),
            r#"{"imported": 0.0, "exported": 0.0, "last_power": null,
                "last_sample_at": null, "device_offset": 200.0,
                "last_device_reading": 50.0}"#,
        )
        .unwrap();
        let counter = counter(dir.path());
        assert_eq!(counter.reconcile(KEY, 60.0).unwrap(), 260.0);
    }

    #[test]
    fn test_save_failure_is_not_reported_as_corrupt_state() {
        let source = serde_json::from_str::<u8>("x").unwrap_err();
        let err = EstimatorError::Encode {
            key: KEY.to_string(),
            source,
        };
        assert!(err.to_string().starts_with("Cannot encode counter state for pv-1-2"));
    }

    #[test]
    fn test_reconcile_offset_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let counter = counter(dir.path());
            counter.reconcile(KEY, 1000.0).unwrap();
            counter.reconcile(KEY, 0.0).unwrap();
        }
        let restarted = counter(dir.path());
        assert_eq!(restarted.reconcile(KEY, 10.0).unwrap(), 1010.0);
    }

    #[test]
    fn test_persistence_failure_is_reported() {
        let counter = SimCounter::new(Unavailable);
        assert!(matches!(
            counter.estimate(KEY, 100.0),
            Err(EstimatorError::Persistence(_))
        ));
        assert!(counter.reconcile(KEY, 100.0).is_err());
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(format!("{KEY}.json")), "not json").unwrap();
        let counter = counter(dir.path());
        assert!(matches!(
            counter.reconcile(KEY, 1.0),
            Err(EstimatorError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_missing_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("simcount").join("pv");
        let counter = counter(&nested);
        counter.reconcile(KEY, 42.0).unwrap();
        assert!(nested.join(format!("{KEY}.json")).exists());
    }
}
