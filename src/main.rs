use std::{env, fs, sync::Arc};

use anyhow::Context;
use plenticore_inverter::{
    ChannelValueStore, Collaborators, DeviceIdentity, FaultLog, InverterState, JsonFilePersistence,
    ModbusTcpTransport, PlenticoreInverter, PluginConfig, SimCounter,
};
use tokio::{net::lookup_host, sync::mpsc, time};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Kostal Plenticore inverter plugin");
    let config = load_config()?;

    let endpoint = config.endpoint();
    let target_address = lookup_host(endpoint.as_str())
        .await
        .with_context(|| format!("Cannot resolve inverter address `{endpoint}`"))?
        .next()
        .with_context(|| format!("No address found for `{endpoint}`"))?;

    // Published states are handed to a consumer task, the same way readings
    // flow to the meter in the channel based setup.
    let (state_tx, mut state_rx) = mpsc::channel::<(u32, InverterState)>(32);
    tokio::spawn(async move {
        while let Some((component_id, state)) = state_rx.recv().await {
            info!(
                component_id,
                power = state.power,
                exported = state.exported,
                "Inverter state"
            );
        }
    });

    let collaborators = Collaborators {
        transport: Arc::new(ModbusTcpTransport::new(
            target_address,
            config.device.timeout(),
        )),
        store: Arc::new(ChannelValueStore::new(state_tx)),
        fault_tracker: Arc::new(FaultLog::new()),
        estimator: Arc::new(SimCounter::new(JsonFilePersistence::new(
            config.counter_dir.clone(),
        ))),
    };
    let identity = DeviceIdentity {
        device_id: config.device.id,
        component_id: config.inverter.id,
        modbus_id: config.device.modbus_id,
    };
    let inverter = PlenticoreInverter::initialize(&config.inverter, identity, collaborators)
        .context("Cannot initialize inverter component")?;

    info!(
        address = %target_address,
        modbus_id = identity.modbus_id,
        policy = ?config.inverter.configuration.exported_policy,
        interval_secs = config.poll_interval_secs,
        "Polling {}",
        inverter.component()
    );

    let mut interval = time::interval(config.poll_interval());
    loop {
        interval.tick().await; // Wait for next sample time
        // Failures are already with the fault tracker, keep polling.
        if let Err(e) = inverter.update().await {
            warn!(component_id = identity.component_id, "Cycle failed: {e}");
        }
    }
}

fn load_config() -> anyhow::Result<PluginConfig> {
    match env::var("PLENTICORE_CONFIG") {
        Ok(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Cannot read configuration file `{path}`"))?;
            PluginConfig::from_json_str(&raw)
                .with_context(|| format!("Invalid configuration file `{path}`"))
        }
        Err(_) => PluginConfig::from_env().context("Invalid PLENTICORE_* environment"),
    }
}
