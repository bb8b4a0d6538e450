//! Acquisition cycle of a Kostal Plenticore inverter component.
//!
//! One call to [`PlenticoreInverter::update`] reads the mapped registers,
//! normalizes them and publishes a complete [`InverterState`]. A cycle either
//! publishes everything or nothing: any failure is handed to the fault tracker
//! and the last published state stays authoritative.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{ExportedPolicy, InverterSetup};
use crate::error::{ConfigError, EstimatorError, NormalizationError, Result};
use crate::fault::{ComponentInfo, FaultTracker};
use crate::normalizer::{normalize_exported, normalize_power};
use crate::register_map::{reading_of, Quantity, RegisterReading, PLENTICORE_REGISTERS};
use crate::sim_counter::{counter_key, EnergyEstimator};
use crate::store::{InverterState, ValueStore};
use crate::transport::RegisterTransport;

/// Who the component is, bound once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: u32,
    pub component_id: u32,
    /// Unit id on the shared Modbus link.
    pub modbus_id: u8,
}

/// External handles the cycle calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn RegisterTransport>,
    pub store: Arc<dyn ValueStore>,
    pub fault_tracker: Arc<dyn FaultTracker>,
    pub estimator: Arc<dyn EnergyEstimator>,
}

pub struct PlenticoreInverter {
    identity: DeviceIdentity,
    component: ComponentInfo,
    exported_policy: ExportedPolicy,
    counter_key: String,
    transport: Arc<dyn RegisterTransport>,
    store: Arc<dyn ValueStore>,
    fault_tracker: Arc<dyn FaultTracker>,
    estimator: Arc<dyn EnergyEstimator>,
}

impl PlenticoreInverter {
    /// Binds the validated setup to its identity and collaborators.
    pub fn initialize(
        setup: &InverterSetup,
        identity: DeviceIdentity,
        collaborators: Collaborators,
    ) -> Result<Self> {
        setup.validate()?;
        if identity.modbus_id == 0 {
            return Err(ConfigError::invalid("modbus_id", "broadcast address 0 cannot be read").into());
        }
        if identity.component_id != setup.id {
            return Err(ConfigError::invalid(
                "component_id",
                format!(
                    "identity names component {} but setup is for {}",
                    identity.component_id, setup.id
                ),
            )
            .into());
        }

        Ok(Self {
            identity,
            component: ComponentInfo::inverter(setup.id, setup.name.clone()),
            exported_policy: setup.configuration.exported_policy,
            counter_key: counter_key(identity.device_id, identity.component_id),
            transport: collaborators.transport,
            store: collaborators.store,
            fault_tracker: collaborators.fault_tracker,
            estimator: collaborators.estimator,
        })
    }

    pub fn component(&self) -> &ComponentInfo {
        &self.component
    }

    /// Runs one acquisition cycle and returns the published state.
    pub async fn update(&self) -> Result<InverterState> {
        match self.acquire().await {
            Ok(state) => {
                self.fault_tracker.clear(&self.component);
                Ok(state)
            }
            Err(e) => {
                self.fault_tracker.report_failure(&self.component, &e);
                Err(e)
            }
        }
    }

    async fn acquire(&self) -> Result<InverterState> {
        let readings = self.read_all().await?;

        let power = normalize_power(value_of(&readings, Quantity::Power)?)?;
        let device_exported = normalize_exported(value_of(&readings, Quantity::Exported)?)?;
        let exported = self.derive_exported(power, device_exported).await;

        let state = InverterState { power, exported };
        self.store.publish(self.component.id, state).await?;
        debug!(
            component_id = self.component.id,
            power = state.power,
            exported = state.exported,
            "Published inverter state"
        );
        Ok(state)
    }

    /// Reads every mapped register in table order, stopping at the first failure.
    async fn read_all(&self) -> Result<Vec<RegisterReading>> {
        let mut readings = Vec::with_capacity(PLENTICORE_REGISTERS.len());
        for &(quantity, register) in PLENTICORE_REGISTERS.iter() {
            let value = self
                .transport
                .read(register, self.identity.modbus_id)
                .await?;
            readings.push(RegisterReading { quantity, value });
        }
        Ok(readings)
    }

    /// Picks the published exported value according to the configured policy.
    ///
    /// The estimator persists its state on every call, so it runs on the
    /// blocking pool. Estimator trouble degrades to the device reading. With
    /// `ResetCorrected` that reading lacks the carried offset, so after a
    /// corrected reset a degraded cycle publishes a lower total than the one
    /// before it. Consumers see the raw counter until the estimator recovers.
    async fn derive_exported(&self, power: f64, device_exported: f64) -> f64 {
        let estimator = Arc::clone(&self.estimator);
        let key = self.counter_key.clone();
        let task = match self.exported_policy {
            ExportedPolicy::Device => return device_exported,
            ExportedPolicy::Simulated => {
                tokio::task::spawn_blocking(move || estimator.estimate(&key, power))
            }
            ExportedPolicy::ResetCorrected => {
                tokio::task::spawn_blocking(move || estimator.reconcile(&key, device_exported))
            }
        };
        let derived = match task.await {
            Ok(derived) => derived,
            Err(e) => Err(EstimatorError::Task(e.to_string())),
        };
        derived.unwrap_or_else(|e| {
            warn!(
                component_id = self.component.id,
                "Energy counter unavailable, publishing device reading: {e}"
            );
            device_exported
        })
    }
}

fn value_of(readings: &[RegisterReading], quantity: Quantity) -> Result<f64, NormalizationError> {
    reading_of(readings, quantity).ok_or(NormalizationError::Missing {
        quantity: quantity.name(),
    })
}
