use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, error, info};

use crate::error::InverterError;

/// Identifies a component in fault reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: u32,
    pub name: String,
    pub kind: &'static str,
}

impl ComponentInfo {
    pub fn inverter(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: "inverter",
        }
    }
}

impl fmt::Display for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.id, self.name)
    }
}

/// Records device level failures of acquisition cycles.
pub trait FaultTracker: Send + Sync {
    fn report_failure(&self, component: &ComponentInfo, error: &InverterError);

    /// Called after a fully successful cycle.
    fn clear(&self, component: &ComponentInfo);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultStatus {
    Ok,
    Error(String),
}

/// Fault tracker that keeps the current status per component and logs
/// transitions.
#[derive(Debug, Default)]
pub struct FaultLog {
    statuses: Mutex<HashMap<u32, FaultStatus>>,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, component_id: u32) -> FaultStatus {
        self.statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(&component_id).cloned())
            .unwrap_or(FaultStatus::Ok)
    }
}

impl FaultTracker for FaultLog {
    fn report_failure(&self, component: &ComponentInfo, error: &InverterError) {
        let message = error.to_string();
        let Ok(mut statuses) = self.statuses.lock() else {
            error!(component = %component, "Fault state lock poisoned, dropping report: {message}");
            return;
        };
        let repeated = matches!(
            statuses.get(&component.id),
            Some(FaultStatus::Error(previous)) if *previous == message
        );
        if repeated {
            debug!(component = %component, "Fault persists: {message}");
        } else {
            error!(component = %component, "{message}");
        }
        statuses.insert(component.id, FaultStatus::Error(message));
    }

    fn clear(&self, component: &ComponentInfo) {
        let Ok(mut statuses) = self.statuses.lock() else {
            return;
        };
        if let Some(FaultStatus::Error(previous)) = statuses.insert(component.id, FaultStatus::Ok) {
            info!(component = %component, "Recovered from: {previous}");
        }
    }
}
