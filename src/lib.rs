//! Kostal Plenticore inverter plugin
//!
//! Polls the inverter over Modbus TCP and publishes generation positive power
//! and cumulative exported energy to a per component value store. Failed
//! cycles go to a fault tracker and never reach the store.

pub mod config;
pub mod error;
pub mod fault;
pub mod inverter;
pub mod normalizer;
pub mod register_map;
pub mod sim_counter;
pub mod store;
pub mod transport;

// Re-export commonly used types for easier access
pub use config::{ExportedPolicy, PluginConfig};
pub use error::InverterError;
pub use fault::{FaultLog, FaultTracker};
pub use inverter::{Collaborators, DeviceIdentity, PlenticoreInverter};
pub use sim_counter::{EnergyEstimator, JsonFilePersistence, SimCounter};
pub use store::{ChannelValueStore, InMemoryValueStore, InverterState, ValueStore};
pub use transport::{ModbusTcpTransport, RegisterTransport};
