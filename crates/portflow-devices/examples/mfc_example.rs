use std::time::Duration;

use portflow_core::config::{DeviceConfig, DeviceKind};
use portflow_core::logging;
use portflow_devices::simulated::SimulatedMfc;
use portflow_devices::{Device, DeviceContext, DeviceError, MfcDevice};

use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the logger
    logging::init_with_filter("trace")?;

    let config = DeviceConfig::new("carrier-gas", DeviceKind::Mfc)
        .with_line(0x0A, Duration::from_millis(500))
        .with_continuous(false);

    let line = SimulatedMfc::new(0x0A).with_latency(Duration::from_millis(2));
    let mfc = MfcDevice::from_config(&config, line.clone(), &DeviceContext::default())?;

    mfc.activate()?;
    mfc.pipeline().sync().await?;
    info!("Controller is {}", mfc.activation_state());

    mfc.set_state(12.5)?.await?;
    info!("Setpoint: {:?}", mfc.rate());

    // A corrupted echo is reported to the caller and leaves the rate alone
    line.script_reply("!0A,S12.400\r\n");
    match mfc.set_state(20.0)?.await {
        Err(DeviceError::ProtocolMismatch { expected, received }) => {
            warn!("Unit answered {:?} instead of {:?}", received, expected)
        }
        other => info!("Unexpected result: {:?}", other),
    }

    if let Some(query) = mfc.get_state()? {
        query.await?;
    }
    info!("Measured rate: {:?}", mfc.rate());

    mfc.deactivate()?;
    mfc.pipeline().sync().await?;
    info!("Wire log: {:?}", line.written());

    mfc.shutdown().await?;
    Ok(())
}
