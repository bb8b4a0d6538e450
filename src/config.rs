//! Plugin configuration.
//!
//! Loaded once at startup, either from a JSON document or from `PLENTICORE_*`
//! environment variables, and validated before anything is wired up.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the published exported energy is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportedPolicy {
    /// Publish the device counter as is.
    Device,
    /// Integrate published power with the simulated counter.
    Simulated,
    /// Publish the device counter with resets carried over.
    #[default]
    ResetCorrected,
}

impl FromStr for ExportedPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" => Ok(Self::Device),
            "simulated" => Ok(Self::Simulated),
            "reset_corrected" => Ok(Self::ResetCorrected),
            other => Err(ConfigError::invalid(
                "exported_policy",
                format!("unknown policy `{other}`"),
            )),
        }
    }
}

/// Connection settings of the inverter, shared by all of its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSetup {
    pub id: u32,
    #[serde(default = "default_device_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_modbus_id")]
    pub modbus_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl DeviceSetup {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InverterConfiguration {
    #[serde(default)]
    pub exported_policy: ExportedPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterSetup {
    pub id: u32,
    #[serde(default = "default_inverter_name")]
    pub name: String,
    #[serde(default)]
    pub configuration: InverterConfiguration,
}

impl InverterSetup {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("inverter.name", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub device: DeviceSetup,
    pub inverter: InverterSetup,
    #[serde(default = "default_counter_dir")]
    pub counter_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_device_name() -> String {
    "Kostal Plenticore".to_string()
}

fn default_inverter_name() -> String {
    "Kostal Plenticore Wechselrichter".to_string()
}

fn default_port() -> u16 {
    1502
}

fn default_modbus_id() -> u8 {
    71
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_counter_dir() -> PathBuf {
    PathBuf::from("simcount")
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl PluginConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from `PLENTICORE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("PLENTICORE_HOST").map_err(|_| ConfigError::Missing("PLENTICORE_HOST"))?;
        let config = Self {
            device: DeviceSetup {
                id: env_or("PLENTICORE_DEVICE_ID", 0)?,
                name: default_device_name(),
                host,
                port: env_or("PLENTICORE_PORT", default_port())?,
                modbus_id: env_or("PLENTICORE_MODBUS_ID", default_modbus_id())?,
                timeout_ms: env_or("PLENTICORE_TIMEOUT_MS", default_timeout_ms())?,
            },
            inverter: InverterSetup {
                id: env_or("PLENTICORE_COMPONENT_ID", 1)?,
                name: default_inverter_name(),
                configuration: InverterConfiguration {
                    exported_policy: env_or("PLENTICORE_EXPORTED_POLICY", ExportedPolicy::default())?,
                },
            },
            counter_dir: env::var("PLENTICORE_COUNTER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_counter_dir()),
            poll_interval_secs: env_or("PLENTICORE_POLL_INTERVAL", default_poll_interval_secs())?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.trim().is_empty() {
            return Err(ConfigError::invalid("device.host", "must not be empty"));
        }
        if self.device.port == 0 {
            return Err(ConfigError::invalid("device.port", "must not be 0"));
        }
        if !(1..=247).contains(&self.device.modbus_id) {
            return Err(ConfigError::invalid(
                "device.modbus_id",
                format!("{} is outside 1..=247", self.device.modbus_id),
            ));
        }
        if self.device.timeout_ms == 0 {
            return Err(ConfigError::invalid("device.timeout_ms", "must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("poll_interval_secs", "must be positive"));
        }
        self.inverter.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// `host:port` of the Modbus TCP endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.device.host, self.device.port)
    }
}

fn env_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(name, format!("cannot parse `{raw}`"))),
        _ => Ok(default),
    }
}
