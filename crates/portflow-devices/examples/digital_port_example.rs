use std::time::Duration;

use portflow_core::config::{ConfigBuilder, DeviceConfig, DeviceKind};
use portflow_core::types::Direction;
use portflow_devices::simulated::SimulatedRegisterPort;
use portflow_devices::{Device, DeviceContext, DeviceEvent, DigitalPort};

use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Settings come from portflow.toml and PORTFLOW__* variables when present
    let settings = ConfigBuilder::new()
        .with_config_file("portflow.toml")
        .with_environment_prefix("PORTFLOW")
        .build()?;
    portflow_core::init_with_config(&settings)?;

    let context = DeviceContext::from_config(&settings);
    let events = context.events.clone();

    // Two inputs and an output on one register, polled continuously
    let config = settings.device("bench-pins").cloned().unwrap_or_else(|| {
        DeviceConfig::new("bench-pins", DeviceKind::Digital)
            .with_channel("door", 0, Direction::Input)
            .with_channel("pressure_ok", 1, Direction::Input)
            .with_channel("lamp", 2, Direction::Output)
    });

    let register = SimulatedRegisterPort::new().with_latency(Duration::from_millis(5));
    let port = DigitalPort::from_config(&config, register.clone(), &context)?;

    // Log activation changes
    let mut changes = events.subscribe::<DeviceEvent>()?;
    tokio::spawn(async move {
        while let Ok(event) = changes.recv().await {
            if let DeviceEvent::ActivationChanged { device_id, old, new } = event {
                info!("{}: {} -> {}", device_id, old, new);
            }
        }
    });

    port.activate()?;

    let timestamp = port.set_state(["lamp"], Vec::<&str>::new())?.await?;
    info!("Lamp switched on at {}", timestamp);

    register.set_inputs(0b01);
    sleep(Duration::from_millis(50)).await;
    info!("Door open: {:?}", port.value("door")?);
    info!("State: {:?}", port.state());

    port.deactivate()?;
    port.pipeline().sync().await?;
    info!("Pipeline stats: {:?}", port.pipeline().stats());

    port.shutdown().await?;
    Ok(())
}
