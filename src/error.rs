use thiserror::Error;

/// Failures while talking to the device over the shared link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Modbus exception {exception} reading register {address}")]
    Exception { address: u16, exception: String },

    #[error("Modbus protocol error: {0}")]
    Protocol(String),

    #[error("Timed out after {timeout_ms}ms reading register {address}")]
    Timeout { address: u16, timeout_ms: u64 },

    #[error("Malformed response for register {address}: expected {expected} words, got {actual}")]
    Malformed {
        address: u16,
        expected: usize,
        actual: usize,
    },
}

/// A decoded value that cannot be turned into a valid engineering value.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("{quantity} reading is not finite: {value}")]
    NotFinite { quantity: &'static str, value: f64 },

    #[error("{quantity} reading is out of range: {value}")]
    OutOfRange { quantity: &'static str, value: f64 },

    #[error("No {quantity} register in the register map")]
    Missing { quantity: &'static str },
}

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("Counter persistence unavailable: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Counter state for {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cannot encode counter state for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Counter state lock poisoned")]
    Poisoned,

    #[error("Counter task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Value store is closed")]
    Closed,

    #[error("Value store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Could not parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Everything that can abort a single acquisition cycle.
#[derive(Debug, Error)]
pub enum InverterError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Normalization failure: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("Estimator failure: {0}")]
    Estimator(#[from] EstimatorError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = InverterError> = std::result::Result<T, E>;
