/*!
 * Rain detector driver.
 *
 * Reports a rain rate and a `RainAlert` light. The light goes Busy above the
 * warning threshold and Alert above the alert threshold; domes and other
 * safety-minded drivers snoop it.
 *
 * Wire commands (ASCII, `#` terminated): `V#` answers `RAIN<version>#`,
 * `R#` answers the current rate in mm/h.
 */
use std::time::Duration;

use tracing::{debug, info};

use crate::connection::io::transact;
use crate::connection::{Handshake, PortIo};
use crate::device::{DeviceCore, Driver, DriverInfo};
use crate::error::{DeviceError, Result};
use crate::property::{
    LightElement, NumberElement, Permission, PropertyBuilder, PropertyState, PropertyValues,
};

/// Alert light
pub const RAIN_ALERT: &str = "RainAlert";
/// Element of the alert light
pub const RAIN_LIGHT: &str = "RAIN";
/// Measured rain rate
pub const RAIN_LEVEL: &str = "RAIN_LEVEL";
/// Element of the rain rate, in mm/h
pub const RAIN_RATE: &str = "RATE";
/// Warning and alert thresholds
pub const RAIN_THRESHOLDS: &str = "RAIN_THRESHOLDS";
/// Warning threshold element
pub const WARNING: &str = "WARNING";
/// Alert threshold element
pub const ALERT: &str = "ALERT";
/// Rain rate the simulator reports
pub const SIM_RAIN_RATE: &str = "SIM_RAIN_RATE";

const POLL: &str = "poll";
const MAX_RATE: f64 = 200.0;
const GROUP: &str = "Weather";

/// Classify a rain rate against the thresholds
pub fn classify(rate: f64, warning: f64, alert: f64) -> PropertyState {
    if rate >= alert {
        PropertyState::Alert
    } else if rate >= warning {
        PropertyState::Busy
    } else {
        PropertyState::Ok
    }
}

/// Rain detector driver
#[derive(Debug)]
pub struct RainDetector {
    io_timeout: Duration,
}

impl RainDetector {
    /// Create a driver waiting at most `io_timeout` for each answer
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    fn thresholds(core: &DeviceCore) -> (f64, f64) {
        let property = core.property(RAIN_THRESHOLDS);
        let warning = property.and_then(|p| p.number(WARNING)).unwrap_or(1.0);
        let alert = property.and_then(|p| p.number(ALERT)).unwrap_or(5.0);
        (warning, alert)
    }

    fn read_rate(&self, core: &mut DeviceCore) -> Result<f64> {
        if core.is_simulation() {
            return Ok(core
                .property(SIM_RAIN_RATE)
                .and_then(|p| p.number(RAIN_RATE))
                .unwrap_or(0.0));
        }
        let timeout = self.io_timeout;
        let port = core.port().ok_or(DeviceError::NotConnected)?;
        let answer = transact(port, "R", "#", b'#', timeout)?;
        answer
            .trim()
            .parse::<f64>()
            .map_err(|_| DeviceError::other(format!("Unexpected rain rate '{}'", answer)))
    }

    /// Read the sensor and publish the rate and the alert light
    fn measure(&mut self, core: &mut DeviceCore) -> Result<()> {
        let rate = self.read_rate(core)?.clamp(0.0, MAX_RATE);
        let (warning, alert) = Self::thresholds(core);
        let status = classify(rate, warning, alert);

        core.update(
            RAIN_LEVEL,
            &PropertyValues::Number(vec![(RAIN_RATE.to_string(), rate)]),
            PropertyState::Ok,
        )?;

        let previous = core.property(RAIN_ALERT).map(|p| p.state());
        if previous != Some(status) {
            info!("Rain status {} at {:.1} mm/h", status, rate);
        }
        core.update(
            RAIN_ALERT,
            &PropertyValues::Light(vec![(RAIN_LIGHT.to_string(), status)]),
            status,
        )
    }
}

impl Default for RainDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Handshake for RainDetector {
    fn handshake(&mut self, port: Option<&mut dyn PortIo>) -> Result<()> {
        let port = match port {
            Some(port) => port,
            None => return Ok(()),
        };
        let answer = transact(port, "V", "#", b'#', self.io_timeout)?;
        if !answer.starts_with("RAIN") {
            return Err(DeviceError::handshake(format!("Unexpected answer '{}'", answer)));
        }
        debug!("Rain detector firmware {}", answer.trim_start_matches("RAIN"));
        Ok(())
    }
}

impl Driver for RainDetector {
    fn driver_info(&self) -> DriverInfo {
        DriverInfo {
            name: "Rain Detector".to_string(),
            exec: "starwire-rain".to_string(),
            version: crate::VERSION.to_string(),
            interface: "weather".to_string(),
        }
    }

    fn init_properties(&mut self, core: &mut DeviceCore) -> Result<()> {
        core.define(
            PropertyBuilder::new(core.name(), RAIN_THRESHOLDS)
                .label("Thresholds")
                .group(GROUP)
                .persist()
                .numbers(vec![
                    NumberElement::new(WARNING, "Warning (mm/h)", 1.0, 0.0, MAX_RATE, 0.1).with_format("%.1f"),
                    NumberElement::new(ALERT, "Alert (mm/h)", 5.0, 0.0, MAX_RATE, 0.1).with_format("%.1f"),
                ])
                .build()?,
        )?;
        core.define(
            PropertyBuilder::new(core.name(), SIM_RAIN_RATE)
                .label("Simulated rain")
                .group("Simulation")
                .numbers(vec![NumberElement::new(RAIN_RATE, "Rate (mm/h)", 0.0, 0.0, MAX_RATE, 0.1)])
                .build()?,
        )
    }

    fn update_properties(&mut self, core: &mut DeviceCore) -> Result<()> {
        if !core.is_connected() {
            core.delete_if_defined(RAIN_LEVEL)?;
            return core.delete_if_defined(RAIN_ALERT);
        }

        core.define(
            PropertyBuilder::new(core.name(), RAIN_LEVEL)
                .label("Rain")
                .group(GROUP)
                .permission(Permission::ReadOnly)
                .numbers(vec![NumberElement::new(RAIN_RATE, "Rate (mm/h)", 0.0, 0.0, MAX_RATE, 0.1).with_format("%.1f")])
                .build()?,
        )?;
        core.define(
            PropertyBuilder::new(core.name(), RAIN_ALERT)
                .label("Rain Alert")
                .group(GROUP)
                .lights(vec![LightElement::new(RAIN_LIGHT, "Rain", PropertyState::Idle)])
                .build()?,
        )?;
        core.set_timer(core.polling_period(), POLL);
        Ok(())
    }

    fn new_number(&mut self, core: &mut DeviceCore, name: &str, values: &[(String, f64)]) -> Result<bool> {
        if name != RAIN_THRESHOLDS {
            return Ok(false);
        }
        let mut candidate = core
            .property(RAIN_THRESHOLDS)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))?;
        candidate.apply_number_values(values, PropertyState::Ok)?;
        let warning = candidate.number(WARNING).unwrap_or_default();
        let alert = candidate.number(ALERT).unwrap_or_default();
        if warning > alert {
            return Err(DeviceError::InvalidStateTransition(
                name.to_string(),
                format!("warning {} is above alert {}", warning, alert),
            ));
        }

        core.apply(name, &PropertyValues::Number(values.to_vec()), PropertyState::Ok)?;
        core.publish(name, None)?;
        Ok(true)
    }

    fn timer_hit(&mut self, core: &mut DeviceCore, tag: &'static str) -> Result<()> {
        if tag != POLL || !core.is_connected() {
            return Ok(());
        }
        core.set_timer(core.polling_period(), POLL);
        self.measure(core)
    }
}
