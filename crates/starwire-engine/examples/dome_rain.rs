//! A dome that closes itself when its rain detector raises an alert.
//!
//! With `STARWIRE_SIMULATE` set both devices start in simulation, so the
//! example runs without hardware:
//!
//! ```text
//! STARWIRE_SIMULATE=1 cargo run --example dome_rain
//! ```
//!
//! Then type records on stdin, for example
//! `{"type":"newProperty","device":"Dome","name":"CONNECTION","values":{"kind":"switch","values":[["CONNECT","On"]]}}`.
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use starwire_core::config::ConfigBuilder;
use starwire_core::logging;
use starwire_devices::connection::serial::SystemPorts;
use starwire_devices::connection::{SerialConnection, TcpConnection};
use starwire_devices::device::{ENABLE, SIMULATION};
use starwire_devices::devices::{Dome, RainDetector};
use starwire_devices::property::{PropertyValues, SwitchState};
use starwire_devices::{Device, DriverContext, Message};
use starwire_engine::{serve_stdio, Reactor};

const RAIN: &str = "Rain Detector";
const DOME: &str = "Dome";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .with_config_file("starwire.toml")
        .with_environment_prefix("STARWIRE")
        .build()
        .context("loading configuration")?;
    logging::init_from_config(&config.logging)?;

    let serial = SerialConnection::new(Arc::new(SystemPorts), config.serial.clone());
    let tcp = TcpConnection::new(config.tcp.clone());
    let (context, jobs) = DriverContext::from_config(config);
    let (outbound_tx, outbound_rx) = mpsc::channel(1024);

    let mut reactor = Reactor::new(jobs, outbound_tx);
    reactor
        .add_device(Device::new(RAIN, RainDetector::default(), context.clone()).with_connection(serial))
        .await?;
    reactor
        .add_device(Device::new(DOME, Dome::new(RAIN), context).with_connection(tcp))
        .await?;

    if std::env::var_os("STARWIRE_SIMULATE").is_some() {
        for device in [RAIN, DOME] {
            reactor
                .dispatch(Message::NewProperty {
                    device: device.to_string(),
                    name: SIMULATION.to_string(),
                    values: PropertyValues::Switch(vec![(ENABLE.to_string(), SwitchState::On)]),
                })
                .await?;
        }
    }

    serve_stdio(reactor, outbound_rx).await?;
    Ok(())
}
