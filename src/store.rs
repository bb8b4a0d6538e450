use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::error::StoreError;

/// Normalized telemetry of one inverter for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InverterState {
    /// Watts, generation positive.
    pub power: f64,
    /// Cumulative exported energy in Wh.
    pub exported: f64,
}

/// Per component state store. Publishing replaces the previous value.
#[async_trait]
pub trait ValueStore: Send + Sync {
    async fn publish(&self, component_id: u32, state: InverterState) -> Result<(), StoreError>;
}

/// Keeps the latest state per component in memory.
#[derive(Debug, Default)]
pub struct InMemoryValueStore {
    values: Mutex<HashMap<u32, InverterState>>,
}

impl InMemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, component_id: u32) -> Option<InverterState> {
        self.values.lock().ok()?.get(&component_id).copied()
    }
}

#[async_trait]
impl ValueStore for InMemoryValueStore {
    async fn publish(&self, component_id: u32, state: InverterState) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(component_id, state);
        Ok(())
    }
}

/// Forwards every published state to a consumer task.
#[derive(Debug, Clone)]
pub struct ChannelValueStore {
    output: Sender<(u32, InverterState)>,
}

impl ChannelValueStore {
    pub fn new(output: Sender<(u32, InverterState)>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl ValueStore for ChannelValueStore {
    async fn publish(&self, component_id: u32, state: InverterState) -> Result<(), StoreError> {
        self.output
            .send((component_id, state))
            .await
            .map_err(|_| StoreError::Closed)
    }
}
